//! Schema version tracker
//!
//! Every shape a raw table has ever had, as an immutable append-only chain.
//! When an incoming file's observed columns differ from the latest recorded
//! version, a new version is appended with a back-link to the previous one.
//! This history is what makes "the downstream transformation broke after an
//! upstream format change" diagnosable.

use diesel::prelude::*;
use uuid::Uuid;

use crate::db::{Database, Result};
use crate::retry::with_write_retry;
use crate::schema::schema_version_tracking;

/// One column of an observed table shape.
///
/// Equality is structural and order matters: the tracker compares full
/// ordered lists of these triples.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub declared_type: String,
    pub nullable: bool,
}

/// Result of submitting an observed schema
#[derive(Debug, Clone)]
pub struct SchemaCheck {
    pub changed: bool,
    pub version: i32,
    pub schema_id: String,
}

/// Insertable schema version
#[derive(Insertable)]
#[diesel(table_name = schema_version_tracking)]
struct NewSchemaVersion<'a> {
    schema_id: &'a str,
    table_name: &'a str,
    schema_version: i32,
    column_definitions: &'a str,
    previous_version_id: Option<&'a str>,
    change_description: &'a str,
    recorded_at: &'a str,
}

/// Queryable schema version
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = schema_version_tracking)]
pub struct SchemaVersion {
    pub schema_id: String,
    pub table_name: String,
    pub schema_version: i32,
    pub column_definitions: String,
    pub previous_version_id: Option<String>,
    pub change_description: String,
    pub recorded_at: String,
}

/// Latest recorded version for a table, if any
pub fn latest_version(db: &Database, table: &str) -> Result<Option<SchemaVersion>> {
    let mut conn = db.ro_conn()?;
    let row = schema_version_tracking::table
        .filter(schema_version_tracking::table_name.eq(table))
        .order(schema_version_tracking::schema_version.desc())
        .first::<SchemaVersion>(&mut conn)
        .optional()?;
    Ok(row)
}

/// Full version chain for a table, oldest first
pub fn version_history(db: &Database, table: &str) -> Result<Vec<SchemaVersion>> {
    let mut conn = db.ro_conn()?;
    let rows = schema_version_tracking::table
        .filter(schema_version_tracking::table_name.eq(table))
        .order(schema_version_tracking::schema_version.asc())
        .load::<SchemaVersion>(&mut conn)?;
    Ok(rows)
}

/// Compare an observed schema against the latest recorded version and append
/// a new version if it differs.
///
/// First observation for a table is version 1 ("Initial schema", no
/// back-link). A matching shape reports `changed=false` and writes nothing.
/// A differing shape appends version prev+1 linked to the prior row.
pub fn check_and_record(db: &Database, table: &str, observed: &[ColumnDef]) -> Result<SchemaCheck> {
    let latest = latest_version(db, table)?;

    let (version, prev_id, description) = match latest {
        None => (1, None, "Initial schema"),
        Some(prev) => {
            let prev_cols: Vec<ColumnDef> =
                serde_json::from_str(&prev.column_definitions).unwrap_or_default();
            if prev_cols == observed {
                return Ok(SchemaCheck {
                    changed: false,
                    version: prev.schema_version,
                    schema_id: prev.schema_id,
                });
            }
            (
                prev.schema_version + 1,
                Some(prev.schema_id),
                "Schema change detected",
            )
        }
    };

    let schema_id = Uuid::new_v4().to_string();
    let now = chrono::Local::now().to_rfc3339();
    let columns_json = serde_json::to_string(observed)
        .map_err(|e| crate::db::DbError::Validation(format!("schema serialization: {}", e)))?;

    let entry = NewSchemaVersion {
        schema_id: &schema_id,
        table_name: table,
        schema_version: version,
        column_definitions: &columns_json,
        previous_version_id: prev_id.as_deref(),
        change_description: description,
        recorded_at: &now,
    };

    with_write_retry(db.retry_policy(), || {
        let mut conn = db.rw_conn()?;
        diesel::insert_into(schema_version_tracking::table)
            .values(&entry)
            .execute(&mut conn)?;
        Ok(())
    })?;

    Ok(SchemaCheck {
        changed: true,
        version,
        schema_id,
    })
}
