//! Layer build orchestrator
//!
//! One invocation per layer: decide full vs incremental from target
//! existence, decide run vs skip from the delta detector, hand the chosen
//! mode to the transformation runner, and leave an immutable audit row in
//! layer_build_runs. Skipping on "no new work" is a normal, successful
//! outcome; a duplicate file upstream must never fail the pipeline or force
//! a rebuild of identical output.
//!
//! Validation failures are tier-dependent: intermediate layers record them
//! as metadata and carry on, the terminal layer treats them as fatal - a bad
//! final report must never be published.

use diesel::prelude::*;
use std::time::Instant;
use uuid::Uuid;

use crate::db::{Database, DbError};
use crate::delta::{combined_delta, DeltaCheck};
use crate::retry::with_write_retry;
use crate::runner::{RunMode, RunnerError, TransformRunner};
use crate::schema::layer_build_runs;

/// Whether a layer's validation failures block the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerTier {
    /// Data-quality issues are recorded but do not fail the run
    Intermediate,
    /// The report layer: failed validation fails the run
    Terminal,
}

/// Static description of one layer handed to the orchestrator
#[derive(Debug, Clone)]
pub struct LayerSpec {
    pub name: String,
    pub tier: LayerTier,
    /// Rule-set selector passed to the transformation runner
    pub selector: String,
    /// Tables this layer materializes; all must exist for incremental mode
    pub target_tables: Vec<String>,
    /// Upstream comparisons that decide whether there is new work
    pub delta_checks: Vec<DeltaCheck>,
}

/// How this invocation (re)built the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Full,
    Incremental,
    Skipped,
}

impl BuildMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildMode::Full => "full",
            BuildMode::Incremental => "incremental",
            BuildMode::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal metadata for one layer invocation
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub run_id: String,
    pub layer: String,
    pub mode: BuildMode,
    pub rows_before: i64,
    pub rows_after: i64,
    pub new_upstream_count: i64,
    /// None when the build was skipped and no validation ran
    pub tests_passed: Option<bool>,
    pub duration_ms: i64,
}

impl BuildOutcome {
    pub fn skipped(&self) -> bool {
        self.mode == BuildMode::Skipped
    }
}

/// Error type for layer builds
#[derive(Debug)]
pub enum BuildError {
    Db(DbError),
    Runner(RunnerError),
    /// The transformation runner reported a non-zero build outcome
    BuildFailed { layer: String, log: String },
    /// Terminal-layer validation failed after a successful build
    TestsFailed { layer: String, log: String },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::Db(e) => write!(f, "Database error: {}", e),
            BuildError::Runner(e) => write!(f, "{}", e),
            BuildError::BuildFailed { layer, log } => {
                write!(f, "Build failed for layer '{}':\n{}", layer, log)
            }
            BuildError::TestsFailed { layer, log } => {
                write!(f, "Validation failed for terminal layer '{}':\n{}", layer, log)
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl From<DbError> for BuildError {
    fn from(e: DbError) -> Self {
        BuildError::Db(e)
    }
}

impl From<RunnerError> for BuildError {
    fn from(e: RunnerError) -> Self {
        BuildError::Runner(e)
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;

/// Insertable run row
#[derive(Insertable)]
#[diesel(table_name = layer_build_runs)]
struct NewLayerBuildRun<'a> {
    run_id: &'a str,
    layer_name: &'a str,
    started_at: &'a str,
    mode: &'a str,
    rows_before: i32,
    rows_after: i32,
    new_upstream_count: i32,
    tests_passed: Option<i32>,
    duration_ms: i32,
    status: &'a str,
    error_message: Option<&'a str>,
}

/// Queryable run row
#[derive(Queryable, Selectable, Debug, Clone, serde::Serialize)]
#[diesel(table_name = layer_build_runs)]
pub struct LayerBuildRun {
    pub run_id: String,
    pub layer_name: String,
    pub started_at: String,
    pub mode: String,
    pub rows_before: i32,
    pub rows_after: i32,
    pub new_upstream_count: i32,
    pub tests_passed: Option<i32>,
    pub duration_ms: i32,
    pub status: String,
    pub error_message: Option<String>,
}

/// Build one layer, recording an audit row whatever the outcome.
///
/// State machine: checking -> skipped | full_build | incremental_build ->
/// tests -> done | failed.
pub fn build_layer(
    db: &Database,
    runner: &dyn TransformRunner,
    spec: &LayerSpec,
) -> Result<BuildOutcome> {
    let run_id = Uuid::new_v4().to_string();
    let started_at = chrono::Local::now().to_rfc3339();
    let clock = Instant::now();

    // checking: existence selects the candidate mode, delta selects run/skip
    let mut all_exist = true;
    for table in &spec.target_tables {
        if !db.table_exists(table)? {
            all_exist = false;
        }
    }
    let delta = combined_delta(db, &spec.delta_checks)?;
    let rows_before = count_targets(db, spec)?;

    let mode = if !all_exist {
        BuildMode::Full
    } else if !delta.has_new {
        BuildMode::Skipped
    } else {
        BuildMode::Incremental
    };

    insert_run(db, &run_id, spec, &started_at, mode, rows_before, delta.new_count)?;

    if mode == BuildMode::Skipped {
        let outcome = BuildOutcome {
            run_id: run_id.clone(),
            layer: spec.name.clone(),
            mode,
            rows_before,
            rows_after: rows_before,
            new_upstream_count: 0,
            tests_passed: None,
            duration_ms: clock.elapsed().as_millis() as i64,
        };
        finalize_run(db, &run_id, "skipped", rows_before, None, outcome.duration_ms, None)?;
        return Ok(outcome);
    }

    // full_build / incremental_build
    let run_mode = match mode {
        BuildMode::Full => RunMode::Full,
        _ => RunMode::Incremental,
    };
    let report = match runner.run(&spec.selector, run_mode) {
        Ok(report) => report,
        Err(e) => {
            let elapsed = clock.elapsed().as_millis() as i64;
            finalize_run(db, &run_id, "failed", rows_before, None, elapsed, Some(&e.to_string()))?;
            return Err(e.into());
        }
    };
    if !report.success {
        // Do not record partial row counts for a failed build
        let elapsed = clock.elapsed().as_millis() as i64;
        finalize_run(db, &run_id, "failed", rows_before, None, elapsed, Some(&report.log))?;
        return Err(BuildError::BuildFailed {
            layer: spec.name.clone(),
            log: report.log,
        });
    }

    // tests
    let test_report = match runner.test(&spec.selector) {
        Ok(report) => report,
        Err(e) => {
            let elapsed = clock.elapsed().as_millis() as i64;
            finalize_run(db, &run_id, "failed", rows_before, None, elapsed, Some(&e.to_string()))?;
            return Err(e.into());
        }
    };
    let tests_passed = test_report.success;
    let rows_after = count_targets(db, spec)?;
    let duration_ms = clock.elapsed().as_millis() as i64;

    if spec.tier == LayerTier::Terminal && !tests_passed {
        finalize_run(
            db,
            &run_id,
            "failed",
            rows_after,
            Some(false),
            duration_ms,
            Some(&test_report.log),
        )?;
        return Err(BuildError::TestsFailed {
            layer: spec.name.clone(),
            log: test_report.log,
        });
    }

    // done
    finalize_run(
        db,
        &run_id,
        "succeeded",
        rows_after,
        Some(tests_passed),
        duration_ms,
        None,
    )?;

    Ok(BuildOutcome {
        run_id,
        layer: spec.name.clone(),
        mode,
        rows_before,
        rows_after,
        new_upstream_count: delta.new_count,
        tests_passed: Some(tests_passed),
        duration_ms,
    })
}

/// Audit columns are i32; clamp rather than wrap on outsized counts
fn clamp_count(n: i64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn count_targets(db: &Database, spec: &LayerSpec) -> Result<i64> {
    let mut total = 0;
    for table in &spec.target_tables {
        total += db.count_rows(table)?;
    }
    Ok(total)
}

fn insert_run(
    db: &Database,
    run_id: &str,
    spec: &LayerSpec,
    started_at: &str,
    mode: BuildMode,
    rows_before: i64,
    new_upstream_count: i64,
) -> Result<()> {
    let entry = NewLayerBuildRun {
        run_id,
        layer_name: &spec.name,
        started_at,
        mode: mode.as_str(),
        rows_before: clamp_count(rows_before),
        rows_after: 0,
        new_upstream_count: clamp_count(new_upstream_count),
        tests_passed: None,
        duration_ms: 0,
        status: "running",
        error_message: None,
    };
    with_write_retry(db.retry_policy(), || {
        let mut conn = db.rw_conn()?;
        diesel::insert_into(layer_build_runs::table)
            .values(&entry)
            .execute(&mut conn)?;
        Ok(())
    })?;
    Ok(())
}

/// Finalize the run row exactly once; it is never touched afterward
fn finalize_run(
    db: &Database,
    run_id: &str,
    status: &str,
    rows_after: i64,
    tests_passed: Option<bool>,
    duration_ms: i64,
    error: Option<&str>,
) -> Result<()> {
    with_write_retry(db.retry_policy(), || {
        let mut conn = db.rw_conn()?;
        diesel::update(layer_build_runs::table.filter(layer_build_runs::run_id.eq(run_id)))
            .set((
                layer_build_runs::status.eq(status),
                layer_build_runs::rows_after.eq(clamp_count(rows_after)),
                layer_build_runs::tests_passed.eq(tests_passed.map(i32::from)),
                layer_build_runs::duration_ms.eq(clamp_count(duration_ms)),
                layer_build_runs::error_message.eq(error),
            ))
            .execute(&mut conn)?;
        Ok(())
    })?;
    Ok(())
}

/// Recent run history, most recent first
pub fn list_runs(db: &Database, limit: i64) -> Result<Vec<LayerBuildRun>> {
    let mut conn = db.ro_conn().map_err(BuildError::Db)?;
    let runs = layer_build_runs::table
        .order(layer_build_runs::started_at.desc())
        .limit(limit)
        .load::<LayerBuildRun>(&mut conn)
        .map_err(|e| BuildError::Db(DbError::Query(e)))?;
    Ok(runs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{RunReport, Result as RunnerResult};
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Scripted runner double that records invocations
    struct MockRunner {
        build_succeeds: bool,
        tests_succeed: bool,
        /// Tables created when run() is invoked, simulating the rule-set
        creates: Vec<(String, i64)>,
        calls: RefCell<Vec<String>>,
        db_path: std::path::PathBuf,
    }

    impl MockRunner {
        fn new(db_path: std::path::PathBuf) -> Self {
            Self {
                build_succeeds: true,
                tests_succeed: true,
                creates: Vec::new(),
                calls: RefCell::new(Vec::new()),
                db_path,
            }
        }

        fn creating(mut self, table: &str, rows: i64) -> Self {
            self.creates.push((table.to_string(), rows));
            self
        }

        fn failing_build(mut self) -> Self {
            self.build_succeeds = false;
            self
        }

        fn failing_tests(mut self) -> Self {
            self.tests_succeed = false;
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl TransformRunner for MockRunner {
        fn run(&self, selector: &str, mode: RunMode) -> RunnerResult<RunReport> {
            self.calls
                .borrow_mut()
                .push(format!("run:{}:{:?}", selector, mode));
            if self.build_succeeds {
                let db = Database::open_at(&self.db_path).unwrap();
                for (table, rows) in &self.creates {
                    db.execute_write(&format!(
                        "CREATE TABLE IF NOT EXISTS {} (account_id TEXT)",
                        table
                    ))
                    .unwrap();
                    db.execute_write(&format!("DELETE FROM {}", table)).unwrap();
                    for i in 0..*rows {
                        db.execute_write(&format!(
                            "INSERT INTO {} VALUES ('k{}')",
                            table, i
                        ))
                        .unwrap();
                    }
                }
            }
            Ok(RunReport {
                success: self.build_succeeds,
                log: if self.build_succeeds {
                    "ok".to_string()
                } else {
                    "compilation error in model".to_string()
                },
            })
        }

        fn test(&self, selector: &str) -> RunnerResult<RunReport> {
            self.calls.borrow_mut().push(format!("test:{}", selector));
            Ok(RunReport {
                success: self.tests_succeed,
                log: if self.tests_succeed {
                    "all tests passed".to_string()
                } else {
                    "not_null check failed".to_string()
                },
            })
        }
    }

    fn temp_db() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn structured_spec() -> LayerSpec {
        LayerSpec {
            name: "structured".to_string(),
            tier: LayerTier::Intermediate,
            selector: "structured".to_string(),
            target_tables: vec!["str_accounts".to_string()],
            delta_checks: vec![DeltaCheck::new(
                "raw_accounts",
                "str_accounts",
                "s.account_id",
                "t.account_id",
            )],
        }
    }

    fn seed_raw(db: &Database, n: i64) {
        db.execute_write("CREATE TABLE IF NOT EXISTS raw_accounts (account_id TEXT)")
            .unwrap();
        for i in 0..n {
            db.execute_write(&format!("INSERT INTO raw_accounts VALUES ('k{}')", i))
                .unwrap();
        }
    }

    #[test]
    fn test_first_run_selects_full_build() {
        let (dir, db) = temp_db();
        seed_raw(&db, 7);
        let runner = MockRunner::new(dir.path().join("test.db")).creating("str_accounts", 7);

        let outcome = build_layer(&db, &runner, &structured_spec()).unwrap();
        assert_eq!(outcome.mode, BuildMode::Full);
        assert_eq!(outcome.new_upstream_count, 7);
        assert_eq!(outcome.rows_before, 0);
        assert_eq!(outcome.rows_after, 7);
        assert_eq!(outcome.tests_passed, Some(true));
        assert_eq!(
            runner.calls(),
            vec!["run:structured:Full", "test:structured"]
        );
    }

    #[test]
    fn test_existing_target_with_new_work_is_incremental() {
        let (dir, db) = temp_db();
        seed_raw(&db, 3);
        let runner = MockRunner::new(dir.path().join("test.db")).creating("str_accounts", 3);
        build_layer(&db, &runner, &structured_spec()).unwrap();

        // Two more raw rows arrive
        db.execute_write("INSERT INTO raw_accounts VALUES ('k3'), ('k4')")
            .unwrap();
        let runner = MockRunner::new(dir.path().join("test.db")).creating("str_accounts", 5);
        let outcome = build_layer(&db, &runner, &structured_spec()).unwrap();
        assert_eq!(outcome.mode, BuildMode::Incremental);
        assert_eq!(outcome.new_upstream_count, 2);
        assert_eq!(runner.calls()[0], "run:structured:Incremental");
    }

    #[test]
    fn test_no_new_work_skips_without_invoking_runner() {
        let (dir, db) = temp_db();
        seed_raw(&db, 3);
        let runner = MockRunner::new(dir.path().join("test.db")).creating("str_accounts", 3);
        build_layer(&db, &runner, &structured_spec()).unwrap();

        let runner = MockRunner::new(dir.path().join("test.db"));
        let outcome = build_layer(&db, &runner, &structured_spec()).unwrap();
        assert_eq!(outcome.mode, BuildMode::Skipped);
        assert_eq!(outcome.new_upstream_count, 0);
        assert_eq!(outcome.rows_before, outcome.rows_after);
        assert_eq!(outcome.tests_passed, None);
        assert!(runner.calls().is_empty());

        // Skip is audited as a successful run
        let runs = list_runs(&db, 10).unwrap();
        assert_eq!(runs[0].status, "skipped");
        assert_eq!(runs[0].mode, "skipped");
    }

    #[test]
    fn test_build_failure_is_fatal_and_audited() {
        let (dir, db) = temp_db();
        seed_raw(&db, 2);
        let runner = MockRunner::new(dir.path().join("test.db")).failing_build();

        let err = build_layer(&db, &runner, &structured_spec()).unwrap_err();
        match err {
            BuildError::BuildFailed { layer, log } => {
                assert_eq!(layer, "structured");
                assert!(log.contains("compilation error"));
            }
            other => panic!("expected BuildFailed, got {:?}", other),
        }

        let runs = list_runs(&db, 10).unwrap();
        assert_eq!(runs[0].status, "failed");
        assert!(runs[0].error_message.as_deref().unwrap().contains("compilation error"));
    }

    #[test]
    fn test_intermediate_test_failure_is_nonfatal() {
        let (dir, db) = temp_db();
        seed_raw(&db, 2);
        let runner = MockRunner::new(dir.path().join("test.db"))
            .creating("str_accounts", 2)
            .failing_tests();

        let outcome = build_layer(&db, &runner, &structured_spec()).unwrap();
        assert_eq!(outcome.tests_passed, Some(false));

        let runs = list_runs(&db, 10).unwrap();
        assert_eq!(runs[0].status, "succeeded");
        assert_eq!(runs[0].tests_passed, Some(0));
    }

    #[test]
    fn test_terminal_test_failure_is_fatal() {
        let (dir, db) = temp_db();
        seed_raw(&db, 2);
        let mut spec = structured_spec();
        spec.tier = LayerTier::Terminal;
        let runner = MockRunner::new(dir.path().join("test.db"))
            .creating("str_accounts", 2)
            .failing_tests();

        let err = build_layer(&db, &runner, &spec).unwrap_err();
        assert!(matches!(err, BuildError::TestsFailed { .. }));

        let runs = list_runs(&db, 10).unwrap();
        assert_eq!(runs[0].status, "failed");
        assert_eq!(runs[0].tests_passed, Some(0));
    }

    #[test]
    fn test_audit_counts_clamp_instead_of_wrapping() {
        assert_eq!(clamp_count(0), 0);
        assert_eq!(clamp_count(42), 42);
        assert_eq!(clamp_count(i64::from(i32::MAX)), i32::MAX);
        assert_eq!(clamp_count(i64::from(i32::MAX) + 1), i32::MAX);
        assert_eq!(clamp_count(i64::MAX), i32::MAX);
    }

    #[test]
    fn test_partially_missing_targets_select_full_build() {
        let (dir, db) = temp_db();
        seed_raw(&db, 1);
        // str_accounts exists but a second target does not
        db.execute_write("CREATE TABLE str_accounts (account_id TEXT)")
            .unwrap();
        let mut spec = structured_spec();
        spec.target_tables.push("str_customers".to_string());
        let runner = MockRunner::new(dir.path().join("test.db"))
            .creating("str_accounts", 1)
            .creating("str_customers", 0);

        let outcome = build_layer(&db, &runner, &spec).unwrap();
        assert_eq!(outcome.mode, BuildMode::Full);
    }
}
