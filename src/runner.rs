//! Transformation-runner collaborator
//!
//! The orchestrator never computes columns itself; it hands a named rule-set
//! selector to a runner and inspects the reported outcome. The shipped
//! implementation shells out to an external program (a dbt-style tool whose
//! CLI takes `run --select <selector> [--full-refresh]` and
//! `test --select <selector>`), capturing output for the audit trail.

use std::path::PathBuf;
use std::process::Command;

/// How a layer build recomputes its target tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Discard and fully recompute the target
    Full,
    /// Merge only new/changed keys, latest-by-ingestion-timestamp winning
    Incremental,
}

/// Captured result of one runner invocation
#[derive(Debug, Clone)]
pub struct RunReport {
    pub success: bool,
    pub log: String,
}

/// Error type for runner invocations that never produced a report
#[derive(Debug)]
pub enum RunnerError {
    Spawn(std::io::Error),
}

impl std::fmt::Display for RunnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::Spawn(e) => write!(f, "Failed to launch runner: {}", e),
        }
    }
}

impl std::error::Error for RunnerError {}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Executes named rule-sets and reports success/failure with captured output
pub trait TransformRunner {
    /// Build the tables selected by `selector` in the given mode
    fn run(&self, selector: &str, mode: RunMode) -> Result<RunReport>;

    /// Run the validation suite scoped to `selector`
    fn test(&self, selector: &str) -> Result<RunReport>;
}

/// Runner backed by an external command
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    project_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            project_dir: None,
            env: Vec::new(),
        }
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn invoke(&self, args: &[&str]) -> Result<RunReport> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        if let Some(dir) = &self.project_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let output = cmd.output().map_err(RunnerError::Spawn)?;
        let mut log = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&stderr);
        }

        Ok(RunReport {
            success: output.status.success(),
            log,
        })
    }
}

impl TransformRunner for CommandRunner {
    fn run(&self, selector: &str, mode: RunMode) -> Result<RunReport> {
        match mode {
            RunMode::Full => self.invoke(&["run", "--select", selector, "--full-refresh"]),
            RunMode::Incremental => self.invoke(&["run", "--select", selector]),
        }
    }

    fn test(&self, selector: &str) -> Result<RunReport> {
        self.invoke(&["test", "--select", selector])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_successful_command_reports_success() {
        // `true` exits 0 with no output
        let runner = CommandRunner::new("true");
        let report = runner.run("structured", RunMode::Incremental).unwrap();
        assert!(report.success);
    }

    #[test]
    fn test_failing_command_reports_failure_not_error() {
        let runner = CommandRunner::new("false");
        let report = runner.test("access").unwrap();
        assert!(!report.success);
    }

    #[test]
    fn test_missing_program_is_a_spawn_error() {
        let runner = CommandRunner::new("stratum-no-such-program");
        assert!(runner.run("structured", RunMode::Full).is_err());
    }

    #[test]
    fn test_output_is_captured() {
        let runner = CommandRunner::new("echo");
        // echo ignores the dbt-style flags and prints them back
        let report = runner.run("curated", RunMode::Full).unwrap();
        assert!(report.log.contains("curated"));
        assert!(report.log.contains("--full-refresh"));
    }
}
