use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::Path;
use std::process;

use stratum::config::Config;
use stratum::db::Database;
use stratum::ingest::IngestOutcome;
use stratum::orchestrator::{self, BuildError, BuildOutcome};
use stratum::runner::CommandRunner;
use stratum::store::{ensure_bucket, DirStore};
use stratum::{export, ingest, ledger, pipeline, schema_track};

#[derive(Parser, Debug)]
#[command(name = "stratum")]
#[command(author, version, about = "Incremental build engine for layered data pipelines")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize .stratum/ with a database, config, and store buckets
    Init,

    /// Ingest the latest landing-bucket file for every configured source
    Ingest,

    /// Build a single layer (skip, full, or incremental as needed)
    Build {
        /// Layer name: structured, curated, or access
        layer: String,
    },

    /// Run the whole pipeline: ingest all sources, then build every layer
    Run,

    /// Show layer tables, row counts, and recent build runs
    Status,

    /// Show the file ingestion ledger
    Ledger,

    /// Show schema version history
    SchemaLog {
        /// Restrict to one raw table
        table: Option<String>,
    },

    /// Export the report table to the access bucket as CSV
    Export,
}

fn main() {
    let args = Args::parse();

    let result = match args.command {
        Command::Init => cmd_init(),
        Command::Ingest => cmd_ingest(),
        Command::Build { layer } => cmd_build(&layer),
        Command::Run => cmd_run(),
        Command::Status => cmd_status(),
        Command::Ledger => cmd_ledger(),
        Command::SchemaLog { table } => cmd_schema_log(table.as_deref()),
        Command::Export => cmd_export(),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn cmd_init() -> CmdResult {
    println!("\n{}", "Initializing Stratum...".cyan().bold());

    let db_path = Database::db_path();
    println!("   {} {}", "Creating".green(), db_path.display());
    Database::open()?;

    let config = Config::default();
    let config_path = Path::new(".stratum").join("config.toml");
    if config_path.exists() {
        println!("   {} {} (already exists)", "Skipping".yellow(), config_path.display());
    } else {
        std::fs::create_dir_all(".stratum")?;
        std::fs::write(&config_path, toml::to_string_pretty(&config)?)?;
        println!("   {} {}", "Creating".green(), config_path.display());
    }

    let store_root = config.store_root();
    for bucket in ["landing", "access"] {
        ensure_bucket(&store_root, bucket)?;
        println!("   {} {}/{}", "Creating".green(), store_root.display(), bucket);
    }

    println!("\n{}", "Stratum initialized!".green().bold());
    println!("\nNext steps:");
    println!(
        "  1. Drop source files into {}",
        format!("{}/landing/", store_root.display()).cyan()
    );
    println!("  2. Run {} to load them into the raw layer", "stratum ingest".cyan());
    println!("  3. Run {} to build all layers", "stratum run".cyan());
    println!();
    Ok(())
}

fn cmd_ingest() -> CmdResult {
    let config = Config::load();
    let db = Database::open()?;
    let store = DirStore::new(config.store_root());

    for spec in config.source_specs() {
        let outcome = ingest::ingest_source(&db, &store, &spec)?;
        print_ingest_outcome(&spec.name, &outcome);
    }
    Ok(())
}

fn cmd_build(layer: &str) -> CmdResult {
    let config = Config::load();
    let db = Database::open()?;
    let layers = pipeline::default_layers();
    let spec = pipeline::find_layer(&layers, layer)?;
    let runner = make_runner(&config);

    match orchestrator::build_layer(&db, &runner, spec) {
        Ok(outcome) => {
            print_build_outcome(&outcome);
            Ok(())
        }
        Err(e @ BuildError::TestsFailed { .. }) => {
            eprintln!("{} {}", "Validation failed:".red().bold(), e);
            process::exit(1);
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_run() -> CmdResult {
    let config = Config::load();
    let db = Database::open()?;
    let store = DirStore::new(config.store_root());
    let runner = make_runner(&config);
    let layers = pipeline::default_layers();

    let report = pipeline::run_pipeline(&db, &store, &runner, &config.source_specs(), &layers)?;

    println!("{}", "Ingestion".cyan().bold());
    for (name, outcome) in &report.ingests {
        print_ingest_outcome(name, outcome);
    }

    println!("\n{}", "Layer builds".cyan().bold());
    for build in &report.builds {
        print_build_outcome(build);
    }

    let rows = export::export_table(&db, &store, &config.export)?;
    println!(
        "\n{} {} rows -> {}/{}",
        "Exported".green(),
        rows,
        config.export.bucket,
        config.export.key
    );
    Ok(())
}

fn cmd_status() -> CmdResult {
    let db = Database::open()?;
    let layers = pipeline::default_layers();

    println!("{}", "Layer tables".cyan().bold());
    for layer in &layers {
        println!("  {}", layer.name.bold());
        for table in &layer.target_tables {
            if db.table_exists(table)? {
                println!("    {} ({} rows)", table, db.count_rows(table)?);
            } else {
                println!("    {} {}", table, "(missing)".yellow());
            }
        }
    }

    println!("\n{}", "Recent builds".cyan().bold());
    let runs = orchestrator::list_runs(&db, 10)?;
    if runs.is_empty() {
        println!("  (none)");
    }
    for run in runs {
        let status = match run.status.as_str() {
            "succeeded" => run.status.green(),
            "skipped" => run.status.yellow(),
            _ => run.status.red(),
        };
        println!(
            "  {} {} {} mode={} rows {} -> {} new={} {}ms",
            run.started_at,
            run.layer_name.bold(),
            status,
            run.mode,
            run.rows_before,
            run.rows_after,
            run.new_upstream_count,
            run.duration_ms
        );
    }
    Ok(())
}

fn cmd_ledger() -> CmdResult {
    let db = Database::open()?;
    let entries = ledger::list_entries(&db)?;
    if entries.is_empty() {
        println!("Ledger is empty; run {} first", "stratum ingest".cyan());
        return Ok(());
    }

    for entry in entries {
        let status = match entry.processing_status.as_str() {
            "completed" => entry.processing_status.green(),
            "failed" => entry.processing_status.red(),
            _ => entry.processing_status.yellow(),
        };
        println!(
            "{} {} {} rows={} hash={} {}",
            entry.ingested_at,
            entry.file_path.bold(),
            status,
            entry.row_count,
            &entry.file_hash[..12.min(entry.file_hash.len())],
            entry
                .error_message
                .map(|m| m.red().to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_schema_log(table: Option<&str>) -> CmdResult {
    let config = Config::load();
    let db = Database::open()?;

    let tables: Vec<String> = match table {
        Some(t) => vec![t.to_string()],
        None => config.sources.iter().map(|s| s.raw_table.clone()).collect(),
    };

    for table in tables {
        let history = schema_track::version_history(&db, &table)?;
        if history.is_empty() {
            println!("{} {}", table.bold(), "(no recorded schema)".yellow());
            continue;
        }
        println!("{}", table.bold());
        for version in history {
            println!(
                "  v{} {} {} {}",
                version.schema_version,
                version.recorded_at,
                version.change_description,
                version
                    .previous_version_id
                    .map(|id| format!("(prev {})", &id[..8.min(id.len())]))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn cmd_export() -> CmdResult {
    let config = Config::load();
    let db = Database::open()?;
    let store = DirStore::new(config.store_root());

    let rows = export::export_table(&db, &store, &config.export)?;
    println!(
        "{} {} rows from {} -> {}/{}",
        "Exported".green(),
        rows,
        config.export.table,
        config.export.bucket,
        config.export.key
    );
    if let Some(path) = &config.export.local_path {
        println!("Local copy: {}", path);
    }
    Ok(())
}

fn make_runner(config: &Config) -> CommandRunner {
    let mut runner = CommandRunner::new(&config.runner.program);
    if let Some(dir) = &config.runner.project_dir {
        runner = runner.with_project_dir(dir);
    }
    runner
}

fn print_ingest_outcome(source: &str, outcome: &IngestOutcome) {
    match outcome {
        IngestOutcome::NoFiles { bucket, prefix } => {
            println!(
                "  {} {}: no files matching '{}' in bucket '{}'",
                "Warning".yellow(),
                source.bold(),
                prefix,
                bucket
            );
        }
        IngestOutcome::Skipped { file_hash } => {
            println!(
                "  {} {}: content {} already ingested",
                "Skipped".yellow(),
                source.bold(),
                &file_hash[..12.min(file_hash.len())]
            );
        }
        IngestOutcome::Ingested {
            row_count,
            schema_version,
            schema_changed,
            ..
        } => {
            let schema_note = if *schema_changed {
                format!(" {}", format!("(schema v{})", schema_version).yellow())
            } else {
                String::new()
            };
            println!(
                "  {} {}: {} rows{}",
                "Ingested".green(),
                source.bold(),
                row_count,
                schema_note
            );
        }
    }
}

fn print_build_outcome(outcome: &BuildOutcome) {
    let mode = match outcome.mode {
        stratum::BuildMode::Skipped => outcome.mode.to_string().yellow(),
        _ => outcome.mode.to_string().green(),
    };
    let tests = match outcome.tests_passed {
        Some(true) => "tests passed".green().to_string(),
        Some(false) => "tests failed".yellow().to_string(),
        None => String::new(),
    };
    println!(
        "  {} {} rows {} -> {} (new upstream: {}) {} {}ms",
        outcome.layer.bold(),
        mode,
        outcome.rows_before,
        outcome.rows_after,
        outcome.new_upstream_count,
        tests,
        outcome.duration_ms
    );
}
