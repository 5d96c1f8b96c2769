//! Access-layer CSV export
//!
//! Publishes the report table to the access bucket as CSV. Every field is
//! quoted and embedded quotes are doubled, so downstream consumers never
//! have to guess at the dialect.

use diesel::prelude::*;
use std::io::Write as _;

use crate::config::ExportConfig;
use crate::db::{quote_ident, Database, DbError};
use crate::store::{ObjectStore, StoreError};

/// Error type for exports
#[derive(Debug)]
pub enum ExportError {
    Db(DbError),
    Store(StoreError),
    Io(std::io::Error),
    MissingTable(String),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::Db(e) => write!(f, "Database error: {}", e),
            ExportError::Store(e) => write!(f, "Store error: {}", e),
            ExportError::Io(e) => write!(f, "IO error: {}", e),
            ExportError::MissingTable(t) => {
                write!(f, "Export table '{}' does not exist; run the pipeline first", t)
            }
        }
    }
}

impl std::error::Error for ExportError {}

impl From<DbError> for ExportError {
    fn from(e: DbError) -> Self {
        ExportError::Db(e)
    }
}

impl From<StoreError> for ExportError {
    fn from(e: StoreError) -> Self {
        ExportError::Store(e)
    }
}

impl From<diesel::result::Error> for ExportError {
    fn from(e: diesel::result::Error) -> Self {
        ExportError::Db(DbError::Query(e))
    }
}

impl From<std::io::Error> for ExportError {
    fn from(e: std::io::Error) -> Self {
        ExportError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(QueryableByName)]
struct CsvLine {
    #[diesel(sql_type = diesel::sql_types::Text)]
    line: String,
}

/// Render the configured table as CSV bytes, header included.
///
/// Formatting happens inside SQLite: each column is cast to text, quotes
/// doubled, and the pieces concatenated, so NULL becomes the empty field.
pub fn render_csv(db: &Database, export: &ExportConfig) -> Result<Vec<u8>> {
    if !db.table_exists(&export.table)? {
        return Err(ExportError::MissingTable(export.table.clone()));
    }

    let fields: Vec<String> = export
        .columns
        .iter()
        .map(|col| {
            format!(
                "'\"' || COALESCE(replace(CAST({} AS TEXT), '\"', '\"\"'), '') || '\"'",
                quote_ident(col)
            )
        })
        .collect();
    let order: Vec<String> = export.columns.iter().map(|c| quote_ident(c)).collect();
    let sql = format!(
        "SELECT {} AS line FROM {} ORDER BY {}",
        fields.join(" || ',' || "),
        quote_ident(&export.table),
        order.join(", "),
    );

    let mut conn = db.ro_conn()?;
    let rows: Vec<CsvLine> = diesel::sql_query(sql).load(&mut conn)?;

    let mut out = Vec::new();
    writeln!(out, "{}", export.columns.join(","))?;
    for row in rows {
        writeln!(out, "{}", row.line)?;
    }
    Ok(out)
}

/// Export the report table to the access bucket (and an optional local copy).
/// Returns the number of data rows written.
pub fn export_table(db: &Database, store: &dyn ObjectStore, export: &ExportConfig) -> Result<i64> {
    let bytes = render_csv(db, export)?;
    let row_count = db.count_rows(&export.table)?;

    store.put_bytes(&export.bucket, &export.key, &bytes)?;
    if let Some(path) = &export.local_path {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, &bytes)?;
    }
    Ok(row_count)
}
