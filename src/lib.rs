// Meter Readings - Core Library
// Import of vendor meter exports into SQLite and filtered reads over them.
// Exposes all modules for use in the CLI, the API server, and tests.

pub mod db;
pub mod error;
pub mod import;
pub mod logging;
pub mod model;
pub mod parser;
pub mod query;

// Re-export commonly used types
pub use db::{
    Database,
    setup_database, truncate_all, drop_all, reset_database,
    create_customer, read_customer, update_customer, delete_customer, list_customers,
    create_reading, update_reading, delete_reading, count_readings,
    insert_customers, insert_readings,
};
pub use error::{MeterError, Result};
pub use import::{FileImport, import_customer_file, import_reading_file, import_reading_path};
pub use model::{Customer, Gender, KindOfMeter, Reading, ReadingDetail};
pub use parser::{
    ImportContext, LineKind,
    classify, parse_customers, parse_readings, parse_customer_file, parse_reading_file,
};
pub use query::{
    ReadingFilter, ReadingQuery, Predicate,
    build_query, find_readings, read_reading, parse_date_param,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
