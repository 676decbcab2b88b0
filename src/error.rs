//! Error types for import, storage and query operations.
//!
//! Every failure propagates to the immediate caller. Nothing in the library
//! retries, and batch writes report one aggregate error instead of per-row
//! outcomes.

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum MeterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Invalid date '{value}' on line {line}")]
    InvalidDate { line: usize, value: String },

    #[error("Invalid meter count '{value}' on line {line}")]
    InvalidMeterCount { line: usize, value: String },

    #[error("Meter count {value} of reading {id} is negative or not finite")]
    InvalidReadingCount { id: Uuid, value: f64 },

    #[error("Invalid customer id '{value}' on line {line}")]
    InvalidCustomerId { line: usize, value: String },

    #[error("Data line {line} appears before any customer announcement")]
    MissingCustomer { line: usize },

    #[error("Invalid date parameter '{0}': expected dd.MM.yyyy or yyyy-MM-dd")]
    InvalidDateParameter(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Expected {expected} affected row(s), storage reported {actual}")]
    RowCountMismatch { expected: usize, actual: usize },

    #[error("Batch insert of {rows} row(s) into {table} failed: {source}")]
    BatchFailed {
        table: &'static str,
        rows: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Cannot hydrate column {column}: {reason}")]
    Hydration { column: usize, reason: String },

    #[error("Connection handle poisoned by a panicking caller")]
    ConnectionPoisoned,
}

impl From<rusqlite::Error> for MeterError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(column, _, reason) => MeterError::Hydration {
                column,
                reason: reason.to_string(),
            },
            other => MeterError::Database(other),
        }
    }
}

impl MeterError {
    /// True when the storage engine rejected a write on a constraint
    /// (duplicate identity, dangling customer reference).
    pub fn is_constraint_violation(&self) -> bool {
        let sqlite = match self {
            MeterError::Database(e) => e,
            MeterError::BatchFailed { source, .. } => source,
            _ => return false,
        };
        matches!(
            sqlite,
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}

pub type Result<T> = std::result::Result<T, MeterError>;
