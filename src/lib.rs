//! Stratum - incremental build engine for layered data pipelines
//!
//! Moves files from a landing bucket through raw, structured, curated, and
//! access layers, doing only the work each layer actually needs.
//!
//! # How it decides
//!
//! | Question | Answered by |
//! |----------|-------------|
//! | Have I seen this file before? | Content-hash ledger (`ledger`) |
//! | Did the file's shape change? | Schema version tracker (`schema_track`) |
//! | Does a layer have new input? | Anti-join delta detector (`delta`) |
//! | Full rebuild or incremental? | Target-table existence (`orchestrator`) |
//!
//! # Quick Start
//!
//! ```no_run
//! use stratum::{Database, DirStore, CommandRunner};
//! use stratum::{pipeline, ingest::SourceSpec};
//!
//! let db = Database::open().unwrap();
//! let store = DirStore::from_env();
//! let runner = CommandRunner::new("dbt");
//!
//! let sources = vec![SourceSpec {
//!     name: "accounts".into(),
//!     bucket: "landing".into(),
//!     prefix: "accounts".into(),
//!     source_type: "accounts".into(),
//!     raw_table: "raw_accounts".into(),
//! }];
//! let layers = pipeline::default_layers();
//!
//! let report = pipeline::run_pipeline(&db, &store, &runner, &sources, &layers).unwrap();
//! for build in &report.builds {
//!     println!("{}: {}", build.layer, build.mode);
//! }
//! ```

pub mod config;
pub mod db;
pub mod delta;
pub mod export;
pub mod hash;
pub mod ingest;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod schema_track;
pub mod store;

pub use config::Config;
pub use db::{Database, DbError};
pub use delta::{DeltaCheck, LayerDelta};
pub use ingest::{IngestOutcome, SourceSpec};
pub use ledger::{IngestStatus, IngestedFile};
pub use orchestrator::{BuildMode, BuildOutcome, LayerSpec, LayerTier};
pub use pipeline::{PipelineReport, run_pipeline};
pub use retry::RetryPolicy;
pub use runner::{CommandRunner, RunMode, TransformRunner};
pub use schema_track::{ColumnDef, SchemaVersion};
pub use store::{DirStore, ObjectStore};
