//! Layer delta detector
//!
//! The central decision primitive reused at every layer boundary: does the
//! upstream relation contain rows whose join key has no match downstream?
//! Computed fresh on every call with a NOT EXISTS anti-join; holds no state
//! and runs on the read-only pool, so it is safe to call repeatedly and
//! concurrently.

use diesel::prelude::*;

use crate::db::{quote_ident, Database, Result};

/// One upstream/downstream comparison.
///
/// The keys are SQL expressions evaluated against aliases `s` (source) and
/// `t` (target), so normalization applied by the transformation rules can be
/// mirrored here (e.g. `trim(cast(s.AccountID as text))` vs `t.account_id`).
#[derive(Debug, Clone)]
pub struct DeltaCheck {
    pub source_table: String,
    pub target_table: String,
    pub source_key: String,
    pub target_key: String,
    /// Optional predicate on `s` restricting which source rows count
    pub source_filter: Option<String>,
}

impl DeltaCheck {
    pub fn new(
        source_table: impl Into<String>,
        target_table: impl Into<String>,
        source_key: impl Into<String>,
        target_key: impl Into<String>,
    ) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            source_key: source_key.into(),
            target_key: target_key.into(),
            source_filter: None,
        }
    }

    pub fn with_source_filter(mut self, filter: impl Into<String>) -> Self {
        self.source_filter = Some(filter.into());
        self
    }
}

/// Transient result of a delta computation; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerDelta {
    pub has_new: bool,
    pub new_count: i64,
}

#[derive(QueryableByName, Debug)]
struct CountRow {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    n: i64,
}

/// Count source rows not yet reflected in the target.
///
/// A missing target table is the normal first-run case, not an error: every
/// source row counts as new. A missing source table yields zero.
pub fn has_new_work(db: &Database, check: &DeltaCheck) -> Result<LayerDelta> {
    if !db.table_exists(&check.source_table)? {
        return Ok(LayerDelta {
            has_new: false,
            new_count: 0,
        });
    }

    if !db.table_exists(&check.target_table)? {
        // First run: every (filtered) source row is new
        let sql = format!(
            "SELECT COUNT(*) AS n FROM {source} s WHERE {filter}",
            source = quote_ident(&check.source_table),
            filter = check.source_filter.as_deref().unwrap_or("1=1"),
        );
        let mut conn = db.ro_conn()?;
        let rows: Vec<CountRow> = diesel::sql_query(sql).load(&mut conn)?;
        let total = rows.first().map(|r| r.n).unwrap_or(0);
        return Ok(LayerDelta {
            has_new: total > 0,
            new_count: total,
        });
    }

    let sql = format!(
        "SELECT COUNT(*) AS n FROM {source} s \
         WHERE {filter} AND NOT EXISTS \
         (SELECT 1 FROM {target} t WHERE {target_key} = {source_key})",
        source = quote_ident(&check.source_table),
        target = quote_ident(&check.target_table),
        filter = check.source_filter.as_deref().unwrap_or("1=1"),
        target_key = check.target_key,
        source_key = check.source_key,
    );

    let mut conn = db.ro_conn()?;
    let rows: Vec<CountRow> = diesel::sql_query(sql).load(&mut conn)?;
    let new_count = rows.first().map(|r| r.n).unwrap_or(0);

    Ok(LayerDelta {
        has_new: new_count > 0,
        new_count,
    })
}

/// Sum several delta checks into one layer-level answer
pub fn combined_delta(db: &Database, checks: &[DeltaCheck]) -> Result<LayerDelta> {
    let mut total = 0;
    for check in checks {
        total += has_new_work(db, check)?.new_count;
    }
    Ok(LayerDelta {
        has_new: total > 0,
        new_count: total,
    })
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

    fn check() -> DeltaCheck {
        DeltaCheck::new(
            "raw_accounts",
            "str_accounts",
            "trim(s.account_id)",
            "t.account_id",
        )
    }

    fn seed_source(db: &Database, ids: &[&str]) {
        db.execute_write("CREATE TABLE IF NOT EXISTS raw_accounts (account_id TEXT)")
            .unwrap();
        for id in ids {
            db.execute_write(&format!("INSERT INTO raw_accounts VALUES ('{}')", id))
                .unwrap();
        }
    }

    fn seed_target(db: &Database, ids: &[&str]) {
        db.execute_write("CREATE TABLE IF NOT EXISTS str_accounts (account_id TEXT)")
            .unwrap();
        for id in ids {
            db.execute_write(&format!("INSERT INTO str_accounts VALUES ('{}')", id))
                .unwrap();
        }
    }

    #[test]
    fn test_missing_target_counts_all_source_rows() {
        let (_dir, db) = temp_db();
        seed_source(&db, &["a1", "a2", "a3", "a4", "a5", "a6", "a7"]);
        let delta = has_new_work(&db, &check()).unwrap();
        assert!(delta.has_new);
        assert_eq!(delta.new_count, 7);
    }

    #[test]
    fn test_missing_source_is_zero() {
        let (_dir, db) = temp_db();
        let delta = has_new_work(&db, &check()).unwrap();
        assert_eq!(
            delta,
            LayerDelta {
                has_new: false,
                new_count: 0
            }
        );
    }

    #[test]
    fn test_subset_target_yields_exact_difference() {
        let (_dir, db) = temp_db();
        seed_source(&db, &["a1", "a2", "a3", "a4", "a5"]);
        seed_target(&db, &["a1", "a2"]);
        let delta = has_new_work(&db, &check()).unwrap();
        assert!(delta.has_new);
        assert_eq!(delta.new_count, 3);
    }

    #[test]
    fn test_fully_caught_up_target() {
        let (_dir, db) = temp_db();
        seed_source(&db, &["a1", "a2"]);
        seed_target(&db, &["a1", "a2"]);
        let delta = has_new_work(&db, &check()).unwrap();
        assert!(!delta.has_new);
        assert_eq!(delta.new_count, 0);
    }

    #[test]
    fn test_key_expressions_are_applied() {
        let (_dir, db) = temp_db();
        // Source keys carry whitespace the target has already trimmed away
        seed_source(&db, &[" a1 ", "a2"]);
        seed_target(&db, &["a1"]);
        let delta = has_new_work(&db, &check()).unwrap();
        assert_eq!(delta.new_count, 1);
    }

    #[test]
    fn test_combined_delta_sums_checks() {
        let (_dir, db) = temp_db();
        seed_source(&db, &["a1", "a2"]);
        db.execute_write("CREATE TABLE raw_customers (customer_id TEXT)")
            .unwrap();
        db.execute_write("INSERT INTO raw_customers VALUES ('c1'), ('c2'), ('c3')")
            .unwrap();

        let checks = vec![
            check(),
            DeltaCheck::new(
                "raw_customers",
                "str_customers",
                "s.customer_id",
                "t.customer_id",
            ),
        ];
        let delta = combined_delta(&db, &checks).unwrap();
        assert_eq!(delta.new_count, 5);
    }

    #[test]
    fn test_source_filter_restricts_counted_rows() {
        let (_dir, db) = temp_db();
        db.execute_write(
            "CREATE TABLE str_accounts (account_id TEXT, account_type TEXT)",
        )
        .unwrap();
        db.execute_write(
            "INSERT INTO str_accounts VALUES \
             ('a1', 'savings'), ('a2', 'checking'), ('a3', 'savings')",
        )
        .unwrap();

        let check = DeltaCheck::new(
            "str_accounts",
            "cur_fact_customer_balances",
            "s.account_id",
            "t.account_id",
        )
        .with_source_filter("s.account_type = 'savings'");

        // Target missing: only the filtered rows count as new
        let delta = has_new_work(&db, &check).unwrap();
        assert_eq!(delta.new_count, 2);

        db.execute_write("CREATE TABLE cur_fact_customer_balances (account_id TEXT)")
            .unwrap();
        db.execute_write("INSERT INTO cur_fact_customer_balances VALUES ('a1')")
            .unwrap();
        let delta = has_new_work(&db, &check).unwrap();
        assert_eq!(delta.new_count, 1);
    }
}
