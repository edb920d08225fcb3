use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind;
use clap::Parser;
use serde::Serialize;
use series_migrate_core::{run_migration, RunReport, REPORT_CONTRACT_VERSION};
use series_migrate_store_sqlite::SqliteStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage:\nseries-migrate file.db\n";

#[derive(Debug, Parser)]
#[command(name = "series-migrate", version)]
#[command(about = "Merge legacy per-system series into their sums and align samples to days")]
struct Cli {
    /// SQLite file holding the TimeSeries table
    db: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            return match err.print() {
                Ok(()) => ExitCode::SUCCESS,
                Err(_) => ExitCode::FAILURE,
            };
        }
        Err(_) => {
            println!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    let Some(db) = cli.db else {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    };

    if !db.exists() {
        println!("File does not exist: {}", db.display());
        return ExitCode::FAILURE;
    }

    init_tracing();
    match run(&db) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .without_time()
        .init();
}

fn run(db: &Path) -> Result<()> {
    let mut store = SqliteStore::open(db)?;
    store.ensure_schema()?;

    info!(path = %db.display(), "starting migration");
    let report = run_migration(&mut store)?;
    info!(
        pairs = report.pairs.len(),
        partitions = report.partitions.len(),
        "migration finished"
    );

    emit_report(&report)
}

#[derive(Serialize)]
struct VersionedReport<'a> {
    contract_version: &'static str,
    #[serde(flatten)]
    report: &'a RunReport,
}

fn emit_report(report: &RunReport) -> Result<()> {
    let versioned = VersionedReport { contract_version: REPORT_CONTRACT_VERSION, report };
    println!("{}", serde_json::to_string_pretty(&versioned)?);
    Ok(())
}
