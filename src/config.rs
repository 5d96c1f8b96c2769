//! Configuration file support for stratum
//!
//! Reads from .stratum/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ingest::SourceSpec;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Object-store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Transformation-runner settings
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Landing-bucket sources feeding the raw layer
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,

    /// Access-layer export settings
    #[serde(default)]
    pub export: ExportConfig,
}

// The serde field defaults only apply during deserialization; this keeps
// `Config::default()` (the no-config-file path) in sync with them
impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            runner: RunnerConfig::default(),
            sources: default_sources(),
            export: ExportConfig::default(),
        }
    }
}

/// Object-store configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct StoreConfig {
    /// Root directory for the local object store.
    /// Default: .stratum/store (overridable with STRATUM_STORE_PATH)
    #[serde(default)]
    pub root: Option<String>,
}

/// Transformation-runner configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunnerConfig {
    /// Program invoked as `<program> run --select <selector> [...]`
    #[serde(default = "default_runner_program")]
    pub program: String,

    /// Working directory for the runner (the transformation project)
    #[serde(default)]
    pub project_dir: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: default_runner_program(),
            project_dir: None,
        }
    }
}

/// One landing-bucket source
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    pub prefix: String,
    pub source_type: String,
    pub raw_table: String,
}

impl SourceConfig {
    pub fn to_spec(&self) -> SourceSpec {
        SourceSpec {
            name: self.name.clone(),
            bucket: self.bucket.clone(),
            prefix: self.prefix.clone(),
            source_type: self.source_type.clone(),
            raw_table: self.raw_table.clone(),
        }
    }
}

/// Access-layer export configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExportConfig {
    #[serde(default = "default_export_table")]
    pub table: String,

    #[serde(default = "default_export_bucket")]
    pub bucket: String,

    #[serde(default = "default_export_key")]
    pub key: String,

    /// Columns exported, in order
    #[serde(default = "default_export_columns")]
    pub columns: Vec<String>,

    /// Optional local copy alongside the object-store upload
    #[serde(default)]
    pub local_path: Option<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            table: default_export_table(),
            bucket: default_export_bucket(),
            key: default_export_key(),
            columns: default_export_columns(),
            local_path: None,
        }
    }
}

fn default_runner_program() -> String {
    "dbt".to_string()
}

fn default_bucket() -> String {
    "landing".to_string()
}

fn default_export_table() -> String {
    "acc_account_summary".to_string()
}

fn default_export_bucket() -> String {
    "access".to_string()
}

fn default_export_key() -> String {
    "account_summary.csv".to_string()
}

fn default_export_columns() -> Vec<String> {
    [
        "customer_id",
        "account_id",
        "original_balance",
        "interest_rate",
        "annual_interest",
        "new_balance",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            name: "accounts".to_string(),
            bucket: default_bucket(),
            prefix: "accounts".to_string(),
            source_type: "accounts".to_string(),
            raw_table: "raw_accounts".to_string(),
        },
        SourceConfig {
            name: "customers".to_string(),
            bucket: default_bucket(),
            prefix: "customers".to_string(),
            source_type: "customers".to_string(),
            raw_table: "raw_customers".to_string(),
        },
    ]
}

impl Config {
    /// Load config from .stratum/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(config) = toml::from_str(&contents) {
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".stratum").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }

    /// Resolved object-store root: env var, then config, then default
    pub fn store_root(&self) -> PathBuf {
        if let Ok(path) = std::env::var("STRATUM_STORE_PATH") {
            return PathBuf::from(path);
        }
        self.store
            .root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".stratum/store"))
    }

    pub fn source_specs(&self) -> Vec<SourceSpec> {
        self.sources.iter().map(|s| s.to_spec()).collect()
    }
}
