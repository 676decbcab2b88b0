use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use meter_readings::{
    find_readings, import_customer_file, import_reading_path, list_customers, logging,
    parse_date_param, reset_database, Database, KindOfMeter, ReadingFilter,
};

#[derive(Parser)]
#[command(name = "meter-readings", version, about = "Import and query utility meter readings")]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "METER_DB_PATH", default_value = "meter_readings.db", global = true)]
    database: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create tables if they do not exist
    Setup,

    /// Drop and recreate all tables
    Reset,

    /// Import a customer export, then reading exports (files or directories)
    Import {
        #[arg(long)]
        customers: Option<PathBuf>,

        readings: Vec<PathBuf>,
    },

    /// List readings, optionally filtered
    Query {
        #[arg(long)]
        customer: Option<Uuid>,

        /// Inclusive start date (dd.MM.yyyy or yyyy-MM-dd)
        #[arg(long, value_parser = date_arg)]
        start: Option<NaiveDate>,

        /// Inclusive end date (dd.MM.yyyy or yyyy-MM-dd)
        #[arg(long, value_parser = date_arg)]
        end: Option<NaiveDate>,

        /// HEATING, WATER, ELECTRICITY or UNKNOWN
        #[arg(long)]
        kind: Option<KindOfMeter>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List all customers
    Customers,
}

fn date_arg(raw: &str) -> std::result::Result<NaiveDate, String> {
    parse_date_param(raw).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let db = Database::open(&cli.database)
        .with_context(|| format!("Failed to open database {}", cli.database.display()))?;

    match cli.command {
        Command::Setup => {
            println!("✓ Database ready at {}", cli.database.display());
        }
        Command::Reset => {
            db.with_conn(reset_database)?;
            println!("✓ Tables dropped and recreated");
        }
        Command::Import { customers, readings } => run_import(&db, customers, readings)?,
        Command::Query {
            customer,
            start,
            end,
            kind,
            json,
        } => {
            let filter = ReadingFilter {
                customer,
                start,
                end,
                kind_of_meter: kind,
            };
            run_query(&db, &filter, json)?;
        }
        Command::Customers => {
            let customers = db.with_conn(list_customers)?;
            for c in &customers {
                let birth = c.birth_date.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
                println!("{}  {:<20} {:<20} {}  {}", c.id, c.first_name, c.last_name, c.gender.as_str(), birth);
            }
            println!("\n{} customers", customers.len());
        }
    }

    Ok(())
}

fn run_import(db: &Database, customers: Option<PathBuf>, readings: Vec<PathBuf>) -> Result<()> {
    // Customers first so every reading's owner exists
    if let Some(path) = customers {
        let imported = db
            .with_conn(|conn| import_customer_file(conn, &path))
            .with_context(|| format!("Failed to import customers from {}", path.display()))?;
        println!("✓ {} customers from {}", imported.rows, path.display());
    }

    let mut total = 0;
    for path in readings {
        let imported = db
            .with_conn(|conn| import_reading_path(conn, &path))
            .with_context(|| format!("Failed to import readings from {}", path.display()))?;
        for file in imported {
            println!("✓ {} readings from {}", file.rows, file.path.display());
            total += file.rows;
        }
    }

    println!("\n💾 Imported {} readings", total);
    Ok(())
}

fn run_query(db: &Database, filter: &ReadingFilter, json: bool) -> Result<()> {
    let readings = db.with_conn(|conn| find_readings(conn, filter))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&readings)?);
        return Ok(());
    }

    for detail in &readings {
        let r = &detail.reading;
        println!(
            "{}  {:<12} {:>12.3}  {:<12} {} {}{}",
            r.date_of_reading,
            r.kind_of_meter.as_str(),
            r.meter_count,
            r.meter_id,
            detail.customer.first_name,
            detail.customer.last_name,
            if r.substitute { "  (substitute)" } else { "" },
        );
    }
    println!("\n{} readings", readings.len());

    Ok(())
}
