/// Wholesaler Credit Sync
///
/// A full-refresh ETL job: reads wholesaler credit limits from SQL Server and
/// replaces the contents of a MySQL staging table with them. Meant to be run
/// by an external scheduler, one run per invocation.
mod cli;
mod config;
mod etl;
mod logging;
mod models;
mod pipeline;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::{Config, LogConfig};
use etl::{extract, load::MySqlSink};
use pipeline::Pipeline;
use std::{env, path::Path, process::ExitCode};

/// Extract or load failed
const EXIT_RUN_FAILED: u8 = 1;
/// Configuration could not be loaded
const EXIT_CONFIG: u8 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    if let Err(e) = cli.validate() {
        eprintln!("{}", e);
        return Ok(ExitCode::from(EXIT_CONFIG));
    }

    // Load environment variables from .env file
    if let Err(e) = load_env(cli.env_file.as_deref()) {
        eprintln!("{:#}", e);
        return Ok(ExitCode::from(EXIT_CONFIG));
    }
    let lookup = |key: &str| cli.env_override(key).or_else(|| env::var(key).ok());

    // Initialize logging
    let log_guard = match logging::init(&LogConfig::from_lookup(lookup)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    tracing::info!("Logging to {}", log_guard.current_path().display());

    let config = match Config::from_lookup(lookup) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };
    tracing::info!(
        "Configuration loaded: source {}, destination {}, load mode {:?}, batch size {}",
        config.source.describe(),
        config.destination.describe(),
        config.load.mode,
        config.load.batch_size
    );

    let source = extract::build_source(&config.source);
    let sink = MySqlSink::new(config.destination, config.load);
    let pipeline = Pipeline::new(source, Box::new(sink));

    if cli.check {
        return Ok(match pipeline.check().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("Connectivity check failed: {}", e);
                ExitCode::from(EXIT_RUN_FAILED)
            }
        });
    }

    let exit_code = match pipeline.run().await {
        Ok(stats) => {
            if cli.summary_json {
                println!("{}", serde_json::to_string(&stats).context("Failed to serialize run summary")?);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("Credit sync failed: {}", e);
            if cli.summary_json {
                println!("{}", serde_json::json!({ "outcome": "failed", "error": e.to_string() }));
            }
            ExitCode::from(EXIT_RUN_FAILED)
        }
    };

    drop(log_guard);
    Ok(exit_code)
}

/// An explicit env file must exist; the default `./.env` is optional
fn load_env(path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            dotenv::from_path(path).with_context(|| format!("Failed to load env file {}", path.display()))?;
        }
        None => {
            dotenv::dotenv().ok();
        }
    }
    Ok(())
}
