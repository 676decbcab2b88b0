// Meter Readings - Web Server
// REST API over customers and readings with Axum

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use chrono::NaiveDate;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use meter_readings::{
    create_customer, create_reading, delete_customer, delete_reading, find_readings,
    import_customer_file, import_reading_path, list_customers, logging, parse_date_param,
    read_customer, read_reading, reset_database, update_customer, update_reading, Customer,
    Database, Gender, KindOfMeter, MeterError, Reading, ReadingFilter,
};

#[derive(Parser)]
#[command(name = "meter-server", version, about = "REST API for utility meter readings")]
struct Args {
    /// SQLite database file
    #[arg(long, env = "METER_DB_PATH", default_value = "meter_readings.db")]
    database: PathBuf,

    /// Address to listen on
    #[arg(long, env = "METER_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Drop and recreate tables before starting
    #[arg(long)]
    reset: bool,

    /// Customer export imported before the server accepts requests
    #[arg(long)]
    customers: Option<PathBuf>,

    /// Reading exports (files or directories) imported before the server accepts requests
    #[arg(long, num_args = 1..)]
    readings: Vec<PathBuf>,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    db: Database,
}

// ============================================================================
// Errors
// ============================================================================

enum ApiError {
    Meter(MeterError),
    /// Body that is not JSON or does not match the expected shape
    BadRequest(String),
}

impl From<MeterError> for ApiError {
    fn from(err: MeterError) -> Self {
        ApiError::Meter(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

fn meter_status(err: &MeterError) -> StatusCode {
    match err {
        MeterError::NotFound { .. } => StatusCode::NOT_FOUND,
        MeterError::InvalidDateParameter(_) | MeterError::InvalidReadingCount { .. } => {
            StatusCode::BAD_REQUEST
        }
        e if e.is_constraint_violation() => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Meter(err) => (meter_status(&err), err.to_string()),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {message}");
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// `Json` extractor whose rejections answer 400 in the API's error shape
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
struct AppJson<T>(T);

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request / response bodies
// ============================================================================

#[derive(Serialize, Deserialize)]
struct CustomerEnvelope<T> {
    customer: T,
}

#[derive(Serialize, Deserialize)]
struct ReadingEnvelope<T> {
    reading: T,
}

#[derive(Serialize)]
struct CustomersResponse {
    customers: Vec<Customer>,
}

/// Customer as posted by clients; the id is generated when absent
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerBody {
    id: Option<Uuid>,
    first_name: String,
    last_name: String,
    #[serde(default)]
    gender: Gender,
    #[serde(default)]
    birth_date: Option<NaiveDate>,
}

impl From<CustomerBody> for Customer {
    fn from(body: CustomerBody) -> Self {
        Customer {
            id: body.id.unwrap_or_else(Uuid::new_v4),
            first_name: body.first_name,
            last_name: body.last_name,
            gender: body.gender,
            birth_date: body.birth_date,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadingBody {
    id: Option<Uuid>,
    #[serde(default)]
    comment: String,
    customer_id: Uuid,
    date_of_reading: NaiveDate,
    #[serde(default)]
    kind_of_meter: KindOfMeter,
    meter_count: f64,
    #[serde(default)]
    meter_id: String,
    #[serde(default)]
    substitute: bool,
}

impl From<ReadingBody> for Reading {
    fn from(body: ReadingBody) -> Self {
        Reading {
            id: body.id.unwrap_or_else(Uuid::new_v4),
            comment: body.comment,
            customer_id: body.customer_id,
            date_of_reading: body.date_of_reading,
            kind_of_meter: body.kind_of_meter,
            meter_count: body.meter_count,
            meter_id: body.meter_id,
            substitute: body.substitute,
        }
    }
}

/// Query string of GET /api/readings
#[derive(Deserialize)]
struct ReadingsParams {
    customer: Option<Uuid>,
    start: Option<String>,
    end: Option<String>,
    #[serde(rename = "kindOfMeter")]
    kind_of_meter: Option<KindOfMeter>,
}

impl ReadingsParams {
    fn into_filter(self) -> Result<ReadingFilter, MeterError> {
        Ok(ReadingFilter {
            customer: self.customer,
            start: self.start.as_deref().map(parse_date_param).transpose()?,
            end: self.end.as_deref().map(parse_date_param).transpose()?,
            kind_of_meter: self.kind_of_meter,
        })
    }
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "OK" }))
}

/// GET /api/customers
async fn get_customers(State(state): State<AppState>) -> ApiResult<Json<CustomersResponse>> {
    let customers = state.db.with_conn(list_customers)?;
    Ok(Json(CustomersResponse { customers }))
}

/// GET /api/customers/:id
async fn get_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Customer>> {
    state
        .db
        .with_conn(|conn| read_customer(conn, id))?
        .map(Json)
        .ok_or(ApiError::Meter(MeterError::NotFound { entity: "customer", id }))
}

/// POST /api/customers
async fn post_customer(
    State(state): State<AppState>,
    AppJson(body): AppJson<CustomerEnvelope<CustomerBody>>,
) -> ApiResult<impl IntoResponse> {
    let customer: Customer = body.customer.into();
    state.db.with_conn(|conn| create_customer(conn, &customer))?;
    Ok((StatusCode::CREATED, Json(CustomerEnvelope { customer })))
}

/// PUT /api/customers - full replace, identity required
async fn put_customer(
    State(state): State<AppState>,
    AppJson(body): AppJson<CustomerEnvelope<Customer>>,
) -> ApiResult<Json<CustomerEnvelope<Customer>>> {
    state.db.with_conn(|conn| update_customer(conn, &body.customer))?;
    Ok(Json(body))
}

/// DELETE /api/customers/:id
async fn remove_customer(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.db.with_conn(|conn| delete_customer(conn, id))?;
    Ok(StatusCode::OK)
}

/// GET /api/readings?customer=&start=&end=&kindOfMeter=
async fn get_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = params.into_filter()?;
    let readings = state.db.with_conn(|conn| find_readings(conn, &filter))?;
    Ok(Json(readings))
}

/// GET /api/readings/:id
async fn get_reading(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let reading = state
        .db
        .with_conn(|conn| read_reading(conn, id))?
        .ok_or(MeterError::NotFound { entity: "reading", id })?;
    Ok(Json(reading))
}

/// POST /api/readings
async fn post_reading(
    State(state): State<AppState>,
    AppJson(body): AppJson<ReadingEnvelope<ReadingBody>>,
) -> ApiResult<impl IntoResponse> {
    let reading: Reading = body.reading.into();
    state.db.with_conn(|conn| create_reading(conn, &reading))?;
    Ok((StatusCode::CREATED, Json(ReadingEnvelope { reading })))
}

/// PUT /api/readings - full replace, identity required
async fn put_reading(
    State(state): State<AppState>,
    AppJson(body): AppJson<ReadingEnvelope<Reading>>,
) -> ApiResult<Json<ReadingEnvelope<Reading>>> {
    state.db.with_conn(|conn| update_reading(conn, &body.reading))?;
    Ok(Json(body))
}

/// DELETE /api/readings/:id
async fn remove_reading(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.db.with_conn(|conn| delete_reading(conn, id))?;
    Ok(StatusCode::OK)
}

/// DELETE /api/setupDB - drop and recreate all tables
async fn setup_db(State(state): State<AppState>) -> ApiResult<StatusCode> {
    state.db.with_conn(reset_database)?;
    Ok(StatusCode::OK)
}

// ============================================================================
// Main Server
// ============================================================================

/// Imports finish before the listener is bound, so no request ever sees a
/// half-imported file.
fn prepare_database(args: &Args) -> anyhow::Result<Database> {
    let db = Database::open(&args.database)
        .with_context(|| format!("Failed to open database {}", args.database.display()))?;

    if args.reset {
        db.with_conn(reset_database)?;
    }

    if let Some(path) = &args.customers {
        db.with_conn(|conn| import_customer_file(conn, path))
            .with_context(|| format!("Failed to import customers from {}", path.display()))?;
    }

    for path in &args.readings {
        db.with_conn(|conn| import_reading_path(conn, path))
            .with_context(|| format!("Failed to import readings from {}", path.display()))?;
    }

    Ok(db)
}

fn router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/customers", get(get_customers).post(post_customer).put(put_customer))
        .route("/customers/:id", get(get_customer).delete(remove_customer))
        .route("/readings", get(get_readings).post(post_reading).put(put_reading))
        .route("/readings/:id", get(get_reading).delete(remove_reading))
        .route("/setupDB", delete(setup_db))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    let db = prepare_database(&args)?;
    let app = router(AppState { db });

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind to {}", args.bind))?;

    info!(addr = %args.bind, "server listening");
    axum::serve(listener, app).await.context("Server stopped unexpectedly")?;

    Ok(())
}
