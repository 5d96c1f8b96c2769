//! Ingestion ledger
//!
//! Append-only record of every file ever ingested, keyed by content hash.
//! This is the sole gate that keeps duplicate appends out of the append-only
//! raw tables: callers check `is_processed` before any downstream write and
//! call `record_attempt` exactly once per attempt, including failure paths,
//! so a failed file can legitimately be retried later.

use diesel::prelude::*;
use uuid::Uuid;

use crate::db::{Database, DbError, Result};
use crate::retry::with_write_retry;
use crate::schema::file_ingestion_metadata;

/// Outcome of one ingestion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Pending,
    Completed,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Completed => "completed",
            IngestStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for IngestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a file being recorded, independent of attempt outcome
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub file_path: String,
    pub file_name: String,
    pub source_type: String,
    pub file_hash: String,
    pub file_size_bytes: i64,
}

/// Insertable ledger entry
#[derive(Insertable)]
#[diesel(table_name = file_ingestion_metadata)]
struct NewIngestedFile<'a> {
    file_id: &'a str,
    file_path: &'a str,
    file_name: &'a str,
    source_type: &'a str,
    file_hash: &'a str,
    file_size_bytes: i64,
    row_count: i32,
    ingested_at: &'a str,
    processing_status: &'a str,
    error_message: Option<&'a str>,
}

/// Queryable ledger entry
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = file_ingestion_metadata)]
pub struct IngestedFile {
    pub file_id: String,
    pub file_path: String,
    pub file_name: String,
    pub source_type: String,
    pub file_hash: String,
    pub file_size_bytes: i64,
    pub row_count: i32,
    pub ingested_at: String,
    pub processing_status: String,
    pub error_message: Option<String>,
}

/// True only if this content hash has a completed ledger entry.
///
/// Pending or failed entries do not count: those files are retryable.
pub fn is_processed(db: &Database, file_hash: &str) -> Result<bool> {
    let mut conn = db.ro_conn()?;
    let found: Option<String> = file_ingestion_metadata::table
        .filter(file_ingestion_metadata::file_hash.eq(file_hash))
        .filter(file_ingestion_metadata::processing_status.eq("completed"))
        .select(file_ingestion_metadata::file_id)
        .first(&mut conn)
        .optional()?;
    Ok(found.is_some())
}

/// Record one ingestion attempt as a single atomic upsert keyed on hash.
///
/// A new hash inserts a fresh row; a retried hash updates only status,
/// error, row count, and timestamp in place, preserving the original
/// file_id. Returns the ledger entry's file_id.
pub fn record_attempt(
    db: &Database,
    meta: &FileMetadata,
    status: IngestStatus,
    row_count: i32,
    error: Option<&str>,
) -> Result<String> {
    let file_id = Uuid::new_v4().to_string();
    let now = chrono::Local::now().to_rfc3339();

    let entry = NewIngestedFile {
        file_id: &file_id,
        file_path: &meta.file_path,
        file_name: &meta.file_name,
        source_type: &meta.source_type,
        file_hash: &meta.file_hash,
        file_size_bytes: meta.file_size_bytes,
        row_count,
        ingested_at: &now,
        processing_status: status.as_str(),
        error_message: error,
    };

    with_write_retry(db.retry_policy(), || {
        let mut conn = db.rw_conn()?;
        diesel::insert_into(file_ingestion_metadata::table)
            .values(&entry)
            .on_conflict(file_ingestion_metadata::file_hash)
            .do_update()
            .set((
                file_ingestion_metadata::processing_status.eq(status.as_str()),
                file_ingestion_metadata::error_message.eq(error),
                file_ingestion_metadata::row_count.eq(row_count),
                file_ingestion_metadata::ingested_at.eq(&now),
            ))
            .execute(&mut conn)?;
        Ok(())
    })?;

    // The upsert may have kept an earlier row; return its id
    let mut conn = db.ro_conn()?;
    file_ingestion_metadata::table
        .filter(file_ingestion_metadata::file_hash.eq(&meta.file_hash))
        .select(file_ingestion_metadata::file_id)
        .first(&mut conn)
        .map_err(DbError::Query)
}

/// Full ingestion history, most recent first
pub fn list_entries(db: &Database) -> Result<Vec<IngestedFile>> {
    let mut conn = db.ro_conn()?;
    let entries = file_ingestion_metadata::table
        .order(file_ingestion_metadata::ingested_at.desc())
        .load::<IngestedFile>(&mut conn)?;
    Ok(entries)
}
