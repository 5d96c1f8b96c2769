//! SQLite database with Diesel ORM
//!
//! Stores the pipeline's durable metadata (ingestion ledger, schema version
//! chain, layer build runs) alongside the layered data tables themselves.
//! Layers map to table-name prefixes: raw_, str_, cur_, acc_.
//!
//! Two connection pools are kept: a read-write pool for mutations (always
//! wrapped in the locked-write executor) and a read-only pool with
//! `PRAGMA query_only` so concurrent readers never block on a writer.

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use std::path::Path;

use crate::retry::{with_write_retry, RetryPolicy};

/// Walk up directory tree to find .stratum folder (like git finds .git)
/// Can be overridden with STRATUM_DB_PATH env var
fn get_db_path() -> std::path::PathBuf {
    // Check env var first - always takes priority
    if let Ok(path) = std::env::var("STRATUM_DB_PATH") {
        return std::path::PathBuf::from(path);
    }

    // Walk up directory tree to find .stratum folder
    if let Ok(current_dir) = std::env::current_dir() {
        let mut dir = current_dir.as_path();
        loop {
            let stratum_dir = dir.join(".stratum");
            if stratum_dir.exists() && stratum_dir.is_dir() {
                return stratum_dir.join("stratum.db");
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break, // Reached filesystem root
            }
        }
    }

    // No .stratum found - default to current directory
    // (stratum init will create it here)
    std::path::PathBuf::from(".stratum/stratum.db")
}

// ============================================================================
// Database Connection
// ============================================================================

type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Pragmas applied when a pooled connection is handed out
#[derive(Debug, Clone, Copy)]
struct ConnectionOptions {
    read_only: bool,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionOptions {
    // Written out in full: the module's `Result` alias carries `DbError`
    fn on_acquire(
        &self,
        conn: &mut SqliteConnection,
    ) -> std::result::Result<(), diesel::r2d2::Error> {
        diesel::sql_query("PRAGMA busy_timeout = 2000")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        if self.read_only {
            // Readers never take the write lock
            diesel::sql_query("PRAGMA query_only = ON")
                .execute(conn)
                .map_err(diesel::r2d2::Error::QueryError)?;
        }
        Ok(())
    }
}

/// Database connection wrapper with read-write and read-only pools
pub struct Database {
    rw_pool: DbPool,
    ro_pool: DbPool,
    retry: RetryPolicy,
}

/// Error type for database operations
#[derive(Debug)]
pub enum DbError {
    Connection(String),
    Query(diesel::result::Error),
    Pool(diesel::r2d2::Error),
    Validation(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Connection(msg) => write!(f, "Connection error: {}", msg),
            DbError::Query(e) => write!(f, "Query error: {}", e),
            DbError::Pool(e) => write!(f, "Pool error: {}", e),
            DbError::Validation(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<diesel::result::Error> for DbError {
    fn from(e: diesel::result::Error) -> Self {
        DbError::Query(e)
    }
}

impl From<diesel::r2d2::Error> for DbError {
    fn from(e: diesel::r2d2::Error) -> Self {
        DbError::Pool(e)
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

// ============================================================================
// Helper structs for raw SQL queries
// ============================================================================

/// Helper for sqlite_master table queries
#[derive(QueryableByName, Debug)]
struct TableInfo {
    #[diesel(sql_type = diesel::sql_types::Text)]
    #[allow(dead_code)]
    name: String,
}

/// Helper for COUNT(*) queries
#[derive(QueryableByName, Debug)]
struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    n: i64,
}

impl Database {
    /// Get the database path that will be used
    pub fn db_path() -> std::path::PathBuf {
        get_db_path()
    }

    /// Create a new database at a custom path
    pub fn new(path: &str) -> Result<Self> {
        Self::open_at(path)
    }

    /// Open database at default path (respects STRATUM_DB_PATH env var)
    pub fn open() -> Result<Self> {
        let path = get_db_path();
        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        Self::open_at(&path)
    }

    /// Open database at specified path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let rw_pool = Pool::builder()
            .max_size(2)
            .connection_customizer(Box::new(ConnectionOptions { read_only: false }))
            .build(ConnectionManager::<SqliteConnection>::new(&path_str))
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let ro_pool = Pool::builder()
            .max_size(5)
            .connection_customizer(Box::new(ConnectionOptions { read_only: true }))
            .build(ConnectionManager::<SqliteConnection>::new(&path_str))
            .map_err(|e| DbError::Connection(e.to_string()))?;

        let db = Self {
            rw_pool,
            ro_pool,
            retry: RetryPolicy::default(),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Override the write-retry policy (mainly for tests)
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Connection for mutating statements
    pub(crate) fn rw_conn(&self) -> Result<DbConn> {
        self.rw_pool
            .get()
            .map_err(|e| DbError::Connection(e.to_string()))
    }

    /// Connection for queries; `PRAGMA query_only` rejects accidental writes
    pub(crate) fn ro_conn(&self) -> Result<DbConn> {
        self.ro_pool
            .get()
            .map_err(|e| DbError::Connection(e.to_string()))
    }

    fn init_schema(&self) -> Result<()> {
        let policy = self.retry;
        with_write_retry(&policy, || {
            let mut conn = self.rw_conn()?;

            // Ingestion ledger: one row per content hash ever seen
            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS file_ingestion_metadata (
                    file_id TEXT PRIMARY KEY NOT NULL,
                    file_path TEXT NOT NULL,
                    file_name TEXT NOT NULL,
                    source_type TEXT NOT NULL,
                    file_hash TEXT NOT NULL UNIQUE,
                    file_size_bytes BIGINT NOT NULL DEFAULT 0,
                    row_count INTEGER NOT NULL DEFAULT 0,
                    ingested_at TEXT NOT NULL,
                    processing_status TEXT NOT NULL DEFAULT 'pending',
                    error_message TEXT
                )
            "#,
            )
            .execute(&mut conn)?;

            // Schema version chain: append-only, back-linked
            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS schema_version_tracking (
                    schema_id TEXT PRIMARY KEY NOT NULL,
                    table_name TEXT NOT NULL,
                    schema_version INTEGER NOT NULL,
                    column_definitions TEXT NOT NULL,
                    previous_version_id TEXT,
                    change_description TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                )
            "#,
            )
            .execute(&mut conn)?;

            // Per-layer run audit trail
            diesel::sql_query(
                r#"
                CREATE TABLE IF NOT EXISTS layer_build_runs (
                    run_id TEXT PRIMARY KEY NOT NULL,
                    layer_name TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    mode TEXT NOT NULL,
                    rows_before INTEGER NOT NULL DEFAULT 0,
                    rows_after INTEGER NOT NULL DEFAULT 0,
                    new_upstream_count INTEGER NOT NULL DEFAULT 0,
                    tests_passed INTEGER,
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    error_message TEXT
                )
            "#,
            )
            .execute(&mut conn)?;

            // Create indexes
            diesel::sql_query(
                "CREATE INDEX IF NOT EXISTS idx_ingestion_hash ON file_ingestion_metadata(file_hash)",
            )
            .execute(&mut conn)?;
            diesel::sql_query(
                "CREATE INDEX IF NOT EXISTS idx_schema_table ON schema_version_tracking(table_name, schema_version)",
            )
            .execute(&mut conn)?;
            diesel::sql_query(
                "CREATE INDEX IF NOT EXISTS idx_runs_layer ON layer_build_runs(layer_name, started_at)",
            )
            .execute(&mut conn)?;

            Ok(())
        })
    }

    // ========================================================================
    // Catalog introspection
    // ========================================================================

    /// Check whether a table exists in the catalog
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let mut conn = self.ro_conn()?;
        let rows: Vec<TableInfo> = diesel::sql_query(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
        )
        .bind::<diesel::sql_types::Text, _>(table)
        .load(&mut conn)?;
        Ok(!rows.is_empty())
    }

    /// Row count for a table; a missing table counts as zero rows.
    ///
    /// Callers that need to distinguish "not yet built" from "built but
    /// empty" should consult `table_exists` first.
    pub fn count_rows(&self, table: &str) -> Result<i64> {
        if !self.table_exists(table)? {
            return Ok(0);
        }
        let mut conn = self.ro_conn()?;
        let rows: Vec<CountRow> =
            diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {}", quote_ident(table)))
                .load(&mut conn)?;
        Ok(rows.first().map(|r| r.n).unwrap_or(0))
    }

    /// Execute a mutating statement through the locked-write executor
    pub fn execute_write(&self, sql: &str) -> Result<usize> {
        let policy = self.retry;
        with_write_retry(&policy, || {
            let mut conn = self.rw_conn()?;
            Ok(diesel::sql_query(sql).execute(&mut conn)?)
        })
    }
}

// ============================================================================
// SQL literal helpers for dynamic data tables
// ============================================================================

/// Quote an identifier (table or column name) for dynamic DDL/DML
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for dynamic DML
pub fn quote_str(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_metadata_tables_created() {
        let (_dir, db) = temp_db();
        assert!(db.table_exists("file_ingestion_metadata").unwrap());
        assert!(db.table_exists("schema_version_tracking").unwrap());
        assert!(db.table_exists("layer_build_runs").unwrap());
    }

    #[test]
    fn test_table_exists_false_for_unknown() {
        let (_dir, db) = temp_db();
        assert!(!db.table_exists("raw_accounts").unwrap());
    }

    #[test]
    fn test_count_rows_missing_table_is_zero() {
        let (_dir, db) = temp_db();
        assert_eq!(db.count_rows("str_accounts").unwrap(), 0);
    }

    #[test]
    fn test_count_rows_counts() {
        let (_dir, db) = temp_db();
        db.execute_write("CREATE TABLE raw_accounts (id TEXT)")
            .unwrap();
        db.execute_write("INSERT INTO raw_accounts VALUES ('a'), ('b'), ('c')")
            .unwrap();
        assert_eq!(db.count_rows("raw_accounts").unwrap(), 3);
    }

    #[test]
    fn test_read_only_pool_rejects_writes() {
        let (_dir, db) = temp_db();
        let mut conn = db.ro_conn().unwrap();
        let result = diesel::sql_query("CREATE TABLE should_fail (id TEXT)").execute(&mut conn);
        assert!(result.is_err());
    }

    #[test]
    fn test_quote_helpers() {
        assert_eq!(quote_ident("raw_accounts"), "\"raw_accounts\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_str("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        {
            let db = Database::open_at(&path).unwrap();
            db.execute_write("CREATE TABLE raw_accounts (id TEXT)")
                .unwrap();
        }
        let db = Database::open_at(&path).unwrap();
        assert!(db.table_exists("raw_accounts").unwrap());
    }
}
