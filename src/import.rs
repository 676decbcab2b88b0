// Bulk import - export files on disk → parsed records → one batch per file
//
// Each file is parsed to completion before anything is written, and each
// file's readings land in a single transaction. Run imports before serving
// read traffic: a reader sharing the database mid-import can see some files
// committed and others not.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::db::{insert_customers, insert_readings};
use crate::error::Result;
use crate::parser::{parse_customer_file, parse_reading_file};

/// Rows written per imported file
#[derive(Debug, Clone, PartialEq)]
pub struct FileImport {
    pub path: PathBuf,
    pub rows: usize,
}

pub fn import_customer_file(conn: &Connection, path: &Path) -> Result<FileImport> {
    let customers = parse_customer_file(path)?;
    let rows = insert_customers(conn, &customers)?;

    info!(file = %path.display(), rows, "customer file imported");
    Ok(FileImport {
        path: path.to_path_buf(),
        rows,
    })
}

pub fn import_reading_file(conn: &Connection, path: &Path) -> Result<FileImport> {
    let readings = parse_reading_file(path)?;
    let rows = insert_readings(conn, &readings)?;

    info!(file = %path.display(), rows, "reading file imported");
    Ok(FileImport {
        path: path.to_path_buf(),
        rows,
    })
}

/// Import one reading export, or every `*.csv` in a directory (name order).
///
/// Stops at the first failing file; files before it stay committed.
pub fn import_reading_path(conn: &Connection, path: &Path) -> Result<Vec<FileImport>> {
    if !path.is_dir() {
        return Ok(vec![import_reading_file(conn, path)?]);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<_>>()?;
    files.retain(|p| {
        p.is_file()
            && p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"))
    });
    files.sort();

    info!(dir = %path.display(), files = files.len(), "importing reading directory");
    files
        .iter()
        .map(|file| import_reading_file(conn, file))
        .collect()
}
