//! Raw-layer ingestion
//!
//! Moves the latest matching object from a landing bucket into an
//! append-only raw table, gated by the ingestion ledger and observed by the
//! schema version tracker. Re-submitting byte-identical content is a normal,
//! successful skip; a bucket with no matching files is a warning, not a
//! failure, and downstream layers simply see no new work.

use diesel::prelude::*;

use crate::db::{quote_ident, quote_str, Database, DbError};
use crate::hash::content_hash;
use crate::ledger::{self, FileMetadata, IngestStatus};
use crate::retry::with_write_retry;
use crate::schema_track::{self, ColumnDef};
use crate::store::{latest_object, ObjectStore, StoreError};

/// One configured landing-bucket source feeding one raw table
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub name: String,
    pub bucket: String,
    pub prefix: String,
    pub source_type: String,
    pub raw_table: String,
}

/// Error type for ingestion
#[derive(Debug)]
pub enum IngestError {
    Db(DbError),
    Store(StoreError),
    Parse(String),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Db(e) => write!(f, "Database error: {}", e),
            IngestError::Store(e) => write!(f, "Store error: {}", e),
            IngestError::Parse(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<DbError> for IngestError {
    fn from(e: DbError) -> Self {
        IngestError::Db(e)
    }
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        IngestError::Store(e)
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Tagged result of one ingestion attempt; skips are successes
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    /// Nothing matched the prefix in the landing bucket
    NoFiles { bucket: String, prefix: String },
    /// Content hash already has a completed ledger entry
    Skipped { file_hash: String },
    /// New content landed in the raw table
    Ingested {
        file_id: String,
        file_hash: String,
        row_count: i64,
        schema_version: i32,
        schema_changed: bool,
    },
}

/// Ingest the most recent matching object for one source.
///
/// The ledger is consulted before any write and updated exactly once per
/// attempt; failures after the hash is known are recorded with
/// status=failed before the error propagates, so the file stays retryable.
pub fn ingest_source(
    db: &Database,
    store: &dyn ObjectStore,
    spec: &SourceSpec,
) -> Result<IngestOutcome> {
    let objects = store.list(&spec.bucket, &spec.prefix)?;
    let Some(latest) = latest_object(&objects) else {
        return Ok(IngestOutcome::NoFiles {
            bucket: spec.bucket.clone(),
            prefix: spec.prefix.clone(),
        });
    };
    let key = latest.key.clone();
    let size = latest.size;

    let bytes = store.get_bytes(&spec.bucket, &key)?;
    let file_hash = content_hash(&bytes);

    if ledger::is_processed(db, &file_hash)? {
        return Ok(IngestOutcome::Skipped { file_hash });
    }

    let meta = FileMetadata {
        file_path: format!("{}/{}", spec.bucket, key),
        file_name: key,
        source_type: spec.source_type.clone(),
        file_hash: file_hash.clone(),
        file_size_bytes: size,
    };

    match load_csv_into_raw(db, spec, &bytes, &meta.file_path, &file_hash) {
        Ok((row_count, check)) => {
            let file_id = ledger::record_attempt(
                db,
                &meta,
                IngestStatus::Completed,
                row_count as i32,
                None,
            )?;
            Ok(IngestOutcome::Ingested {
                file_id,
                file_hash,
                row_count,
                schema_version: check.version,
                schema_changed: check.changed,
            })
        }
        Err(e) => {
            // Record the failure so it is auditable and the hash retryable;
            // if even that write fails, say so before the original error wins
            if let Err(ledger_err) =
                ledger::record_attempt(db, &meta, IngestStatus::Failed, 0, Some(&e.to_string()))
            {
                eprintln!(
                    "Could not record failed ingestion of {} in the ledger: {}",
                    meta.file_path, ledger_err
                );
            }
            Err(e)
        }
    }
}

/// Parse, track schema, and append to the raw table
fn load_csv_into_raw(
    db: &Database,
    spec: &SourceSpec,
    bytes: &[u8],
    source_file: &str,
    file_hash: &str,
) -> Result<(i64, schema_track::SchemaCheck)> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| IngestError::Parse(format!("{}: not valid UTF-8: {}", spec.name, e)))?;
    let (header, rows) = parse_csv(text)?;

    let observed = detect_schema(&header, &rows);
    let check = schema_track::check_and_record(db, &spec.raw_table, &observed)?;

    ensure_raw_table(db, &spec.raw_table, &observed)?;
    append_rows(db, &spec.raw_table, &header, &rows, source_file, file_hash)?;

    Ok((rows.len() as i64, check))
}

// ============================================================================
// CSV plumbing
// ============================================================================

/// Minimal CSV reader: quoted fields, doubled-quote escapes, embedded
/// newlines inside quotes. Returns header plus data rows, each padded or
/// truncated to the header width.
pub fn parse_csv(text: &str) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    // Distinguishes a truly blank line (skipped) from a single-column row
    // whose only field is empty but was written as `""` or followed data
    let mut line_has_content = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
        } else {
            match c {
                '"' => {
                    in_quotes = true;
                    line_has_content = true;
                }
                ',' => {
                    record.push(std::mem::take(&mut field));
                    line_has_content = true;
                }
                '\r' => {}
                '\n' => {
                    record.push(std::mem::take(&mut field));
                    if line_has_content {
                        records.push(std::mem::take(&mut record));
                    } else {
                        record.clear();
                    }
                    line_has_content = false;
                }
                _ => {
                    field.push(c);
                    line_has_content = true;
                }
            }
        }
    }
    if in_quotes {
        return Err(IngestError::Parse("unterminated quoted field".to_string()));
    }
    if line_has_content {
        record.push(field);
        records.push(record);
    }

    let mut iter = records.into_iter();
    let header = iter
        .next()
        .ok_or_else(|| IngestError::Parse("empty file".to_string()))?;
    let width = header.len();

    let rows = iter
        .map(|mut r| {
            r.resize(width, String::new());
            r
        })
        .collect();

    Ok((header, rows))
}

/// Infer {name, declared_type, nullable} per column from the data values.
///
/// Empty strings count as nulls and are excluded from type inference.
pub fn detect_schema(header: &[String], rows: &[Vec<String>]) -> Vec<ColumnDef> {
    header
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let values: Vec<&str> = rows.iter().map(|r| r[i].as_str()).collect();
            let nullable = values.iter().any(|v| v.is_empty());
            let present: Vec<&&str> = values.iter().filter(|v| !v.is_empty()).collect();

            let declared_type = if present.is_empty() {
                "text"
            } else if present.iter().all(|v| v.parse::<i64>().is_ok()) {
                "integer"
            } else if present.iter().all(|v| v.parse::<f64>().is_ok()) {
                "real"
            } else if present
                .iter()
                .all(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "false"))
            {
                "boolean"
            } else {
                "text"
            };

            ColumnDef {
                name: name.clone(),
                declared_type: declared_type.to_string(),
                nullable,
            }
        })
        .collect()
}

fn sql_type(declared: &str) -> &'static str {
    match declared {
        "integer" => "INTEGER",
        "real" => "REAL",
        "boolean" => "INTEGER",
        _ => "TEXT",
    }
}

/// Helper for PRAGMA table_info queries
#[derive(QueryableByName, Debug)]
struct PragmaTableInfo {
    #[diesel(sql_type = diesel::sql_types::Text)]
    name: String,
}

/// Create the raw table on first sight; add columns that later files
/// introduce so drifted schemas still append.
fn ensure_raw_table(db: &Database, table: &str, observed: &[ColumnDef]) -> Result<()> {
    if !db.table_exists(table)? {
        let mut cols: Vec<String> = observed
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(&c.declared_type)))
            .collect();
        cols.push("_source_file TEXT".to_string());
        cols.push("_file_hash TEXT".to_string());
        cols.push("_row_number INTEGER".to_string());
        cols.push("_ingested_at TEXT".to_string());
        db.execute_write(&format!(
            "CREATE TABLE {} ({})",
            quote_ident(table),
            cols.join(", ")
        ))?;
        return Ok(());
    }

    let mut conn = db.ro_conn().map_err(IngestError::Db)?;
    let existing: Vec<PragmaTableInfo> =
        diesel::sql_query(format!("PRAGMA table_info({})", quote_ident(table)))
            .load(&mut conn)
            .map_err(|e| IngestError::Db(DbError::Query(e)))?;
    drop(conn);

    for col in observed {
        if !existing.iter().any(|c| c.name == col.name) {
            db.execute_write(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                quote_ident(&col.name),
                sql_type(&col.declared_type)
            ))?;
        }
    }
    Ok(())
}

/// Append rows with provenance columns; the raw layer never updates.
///
/// All chunks commit in a single transaction: a failure anywhere rolls the
/// whole file back, so the ledger's failed entry can be retried without
/// re-appending chunks that already landed.
fn append_rows(
    db: &Database,
    raw_table: &str,
    header: &[String],
    rows: &[Vec<String>],
    source_file: &str,
    file_hash: &str,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }

    let ingested_at = chrono::Local::now().to_rfc3339();

    let mut columns: Vec<String> = header.iter().map(|c| quote_ident(c)).collect();
    columns.extend(
        ["_source_file", "_file_hash", "_row_number", "_ingested_at"]
            .iter()
            .map(|c| c.to_string()),
    );
    let column_list = columns.join(", ");

    // Chunked multi-row inserts keep statement size bounded
    let mut statements = Vec::new();
    for (chunk_index, chunk) in rows.chunks(200).enumerate() {
        let mut values = Vec::with_capacity(chunk.len());
        for (i, row) in chunk.iter().enumerate() {
            let row_number = chunk_index * 200 + i + 1;
            let fields: Vec<String> = row
                .iter()
                .map(|v| {
                    if v.is_empty() {
                        "NULL".to_string()
                    } else {
                        quote_str(v)
                    }
                })
                .collect();
            values.push(format!(
                "({}, {}, {}, {}, {})",
                fields.join(", "),
                quote_str(source_file),
                quote_str(file_hash),
                row_number,
                quote_str(&ingested_at)
            ));
        }
        statements.push(format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote_ident(raw_table),
            column_list,
            values.join(", ")
        ));
    }

    with_write_retry(db.retry_policy(), || {
        let mut conn = db.rw_conn()?;
        conn.transaction(|conn| {
            for stmt in &statements {
                diesel::sql_query(stmt).execute(conn)?;
            }
            Ok(())
        })
    })?;
    Ok(())
}
