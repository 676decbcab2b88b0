use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MeterError, Result};
use crate::model::{Customer, Reading};

// ============================================================================
// CONNECTION HANDLE
// ============================================================================

/// Shared handle to the SQLite database.
///
/// Operations check the connection out for the duration of a single call
/// through [`Database::with_conn`]; nothing holds it between calls.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database file and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        setup_database(&conn)?;
        info!(path = %path.display(), "database opened");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Database {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run one operation against the connection, releasing it afterwards
    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.conn.lock().map_err(|_| MeterError::ConnectionPoisoned)?;
        f(&guard)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS Customer (
            id TEXT PRIMARY KEY NOT NULL,
            firstName TEXT NOT NULL,
            lastName TEXT NOT NULL,
            birthDate TEXT,
            gender TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS Reading (
            id TEXT PRIMARY KEY NOT NULL,
            comment TEXT NOT NULL,
            customer TEXT NOT NULL REFERENCES Customer(id),
            dateOfReading TEXT NOT NULL,
            kindOfMeter TEXT NOT NULL,
            meterCount REAL NOT NULL CHECK (meterCount >= 0),
            meterId TEXT NOT NULL,
            substitute INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reading_customer ON Reading(customer)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reading_date ON Reading(dateOfReading)",
        [],
    )?;

    Ok(())
}

/// Delete every row, readings first so no customer is left referenced
pub fn truncate_all(conn: &Connection) -> Result<()> {
    conn.execute_batch("DELETE FROM Reading; DELETE FROM Customer;")?;
    Ok(())
}

pub fn drop_all(conn: &Connection) -> Result<()> {
    conn.execute_batch("DROP TABLE IF EXISTS Reading; DROP TABLE IF EXISTS Customer;")?;
    Ok(())
}

/// Drop and recreate both tables
pub fn reset_database(conn: &Connection) -> Result<()> {
    drop_all(conn)?;
    setup_database(conn)?;
    info!("database reset");
    Ok(())
}

// ============================================================================
// ROW HELPERS
// ============================================================================

/// Read a TEXT column holding a UUID
pub(crate) fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let text: String = row.get(idx)?;
    Uuid::parse_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// Meter counts are non-negative measurements, whatever path writes them
fn validate_reading(reading: &Reading) -> Result<()> {
    if reading.meter_count.is_finite() && reading.meter_count >= 0.0 {
        Ok(())
    } else {
        Err(MeterError::InvalidReadingCount {
            id: reading.id,
            value: reading.meter_count,
        })
    }
}

/// Single-row writes must touch exactly one row
fn expect_one(affected: usize, entity: &'static str, id: Uuid) -> Result<()> {
    match affected {
        1 => Ok(()),
        0 => Err(MeterError::NotFound { entity, id }),
        actual => Err(MeterError::RowCountMismatch { expected: 1, actual }),
    }
}

const INSERT_CUSTOMER: &str =
    "INSERT INTO Customer (id, firstName, lastName, birthDate, gender) VALUES (?1, ?2, ?3, ?4, ?5)";

const INSERT_READING: &str = "INSERT INTO Reading (
        id, comment, customer, dateOfReading, kindOfMeter, meterCount, meterId, substitute
    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

// ============================================================================
// CUSTOMERS
// ============================================================================

pub fn create_customer(conn: &Connection, customer: &Customer) -> Result<()> {
    let affected = conn.execute(
        INSERT_CUSTOMER,
        params![
            customer.id.to_string(),
            customer.first_name,
            customer.last_name,
            customer.birth_date,
            customer.gender,
        ],
    )?;
    expect_one(affected, "customer", customer.id)
}

pub fn read_customer(conn: &Connection, id: Uuid) -> Result<Option<Customer>> {
    let mut stmt = conn.prepare(
        "SELECT id, firstName, lastName, birthDate, gender FROM Customer WHERE id = ?1",
    )?;

    let mut rows = stmt.query_map([id.to_string()], customer_from_row)?;
    Ok(rows.next().transpose()?)
}

/// Replace every field but the identity
pub fn update_customer(conn: &Connection, customer: &Customer) -> Result<()> {
    let affected = conn.execute(
        "UPDATE Customer SET firstName = ?1, lastName = ?2, birthDate = ?3, gender = ?4 WHERE id = ?5",
        params![
            customer.first_name,
            customer.last_name,
            customer.birth_date,
            customer.gender,
            customer.id.to_string(),
        ],
    )?;
    expect_one(affected, "customer", customer.id)
}

/// Fails with a constraint violation while readings still reference the customer
pub fn delete_customer(conn: &Connection, id: Uuid) -> Result<()> {
    let affected = conn.execute("DELETE FROM Customer WHERE id = ?1", [id.to_string()])?;
    expect_one(affected, "customer", id)
}

pub fn list_customers(conn: &Connection) -> Result<Vec<Customer>> {
    let mut stmt = conn.prepare(
        "SELECT id, firstName, lastName, birthDate, gender
         FROM Customer
         ORDER BY lastName, firstName, id",
    )?;

    let customers = stmt
        .query_map([], customer_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(customers)
}

fn customer_from_row(row: &Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: uuid_at(row, 0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        birth_date: row.get(3)?,
        gender: row.get(4)?,
    })
}

// ============================================================================
// READINGS (reads live in query.rs, they always join the customer)
// ============================================================================

pub fn create_reading(conn: &Connection, reading: &Reading) -> Result<()> {
    validate_reading(reading)?;
    let affected = conn.execute(
        INSERT_READING,
        params![
            reading.id.to_string(),
            reading.comment,
            reading.customer_id.to_string(),
            reading.date_of_reading,
            reading.kind_of_meter,
            reading.meter_count,
            reading.meter_id,
            reading.substitute,
        ],
    )?;
    expect_one(affected, "reading", reading.id)
}

pub fn update_reading(conn: &Connection, reading: &Reading) -> Result<()> {
    validate_reading(reading)?;
    let affected = conn.execute(
        "UPDATE Reading
         SET comment = ?1, customer = ?2, dateOfReading = ?3, kindOfMeter = ?4,
             meterCount = ?5, meterId = ?6, substitute = ?7
         WHERE id = ?8",
        params![
            reading.comment,
            reading.customer_id.to_string(),
            reading.date_of_reading,
            reading.kind_of_meter,
            reading.meter_count,
            reading.meter_id,
            reading.substitute,
            reading.id.to_string(),
        ],
    )?;
    expect_one(affected, "reading", reading.id)
}

pub fn delete_reading(conn: &Connection, id: Uuid) -> Result<()> {
    let affected = conn.execute("DELETE FROM Reading WHERE id = ?1", [id.to_string()])?;
    expect_one(affected, "reading", id)
}

pub fn count_readings(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM Reading", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// BATCH WRITER
// ============================================================================

/// Insert all customers in one transaction, returning the affected-row total.
///
/// Any failing row rolls the whole batch back and is reported as a single
/// `BatchFailed` error.
pub fn insert_customers(conn: &Connection, customers: &[Customer]) -> Result<usize> {
    let inserted = run_batch(conn, "Customer", customers.len(), |tx| {
        let mut stmt = tx.prepare_cached(INSERT_CUSTOMER)?;
        let mut total = 0;
        for customer in customers {
            total += stmt.execute(params![
                customer.id.to_string(),
                customer.first_name,
                customer.last_name,
                customer.birth_date,
                customer.gender,
            ])?;
        }
        Ok(total)
    })?;

    info!(inserted, "customers inserted");
    Ok(inserted)
}

/// Insert all readings in one transaction; same failure contract as
/// [`insert_customers`]. Counts are validated before anything is written.
pub fn insert_readings(conn: &Connection, readings: &[Reading]) -> Result<usize> {
    readings.iter().try_for_each(validate_reading)?;

    let inserted = run_batch(conn, "Reading", readings.len(), |tx| {
        let mut stmt = tx.prepare_cached(INSERT_READING)?;
        let mut total = 0;
        for reading in readings {
            total += stmt.execute(params![
                reading.id.to_string(),
                reading.comment,
                reading.customer_id.to_string(),
                reading.date_of_reading,
                reading.kind_of_meter,
                reading.meter_count,
                reading.meter_id,
                reading.substitute,
            ])?;
        }
        Ok(total)
    })?;

    info!(inserted, "readings inserted");
    Ok(inserted)
}

fn run_batch<F>(conn: &Connection, table: &'static str, rows: usize, insert: F) -> Result<usize>
where
    F: FnOnce(&rusqlite::Transaction<'_>) -> rusqlite::Result<usize>,
{
    let batch_failed = |source| MeterError::BatchFailed { table, rows, source };

    // Dropping the transaction without commit rolls every row back
    let tx = conn.unchecked_transaction().map_err(batch_failed)?;
    let total = insert(&tx).map_err(batch_failed)?;
    tx.commit().map_err(batch_failed)?;

    debug!(table, rows, total, "batch committed");
    Ok(total)
}
