/// CLI Module
///
/// Command-line interface configuration using clap. Flags override the
/// matching environment variables.
use crate::config::{LoadMode, SourceDriver, MAX_BATCH_SIZE};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Wholesaler Credit Sync - ETL Job
///
/// Copy wholesaler credit limits from SQL Server into the MySQL staging table
#[derive(Parser, Debug)]
#[command(name = "wholesaler-credit-sync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Read environment variables from this file instead of ./.env
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Source driver (overrides SOURCE_DRIVER env var)
    #[arg(short = 's', long, value_enum, value_name = "DRIVER")]
    pub source_driver: Option<SourceDriver>,

    /// How the staging table is replaced (overrides LOAD_MODE env var)
    #[arg(short = 'm', long, value_enum, value_name = "MODE")]
    pub load_mode: Option<LoadMode>,

    /// Rows per INSERT statement (overrides LOAD_BATCH_SIZE env var)
    #[arg(short = 'b', long, value_name = "SIZE")]
    pub batch_size: Option<usize>,

    /// Log directory (overrides LOG_DIR env var)
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Only check that both databases are reachable
    #[arg(long)]
    pub check: bool,

    /// Print a JSON run summary to stdout when the run finishes
    #[arg(long)]
    pub summary_json: bool,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(size) = self.batch_size {
            if size == 0 {
                anyhow::bail!("Batch size must be greater than 0");
            }
            if size > MAX_BATCH_SIZE {
                anyhow::bail!("Batch size must be at most {} (MySQL placeholder limit)", MAX_BATCH_SIZE);
            }
        }

        Ok(())
    }

    /// Value a flag supplies for an environment key, if any
    pub fn env_override(&self, key: &str) -> Option<String> {
        match key {
            "SOURCE_DRIVER" => self.source_driver.and_then(|d| enum_name(&d)),
            "LOAD_MODE" => self.load_mode.and_then(|m| enum_name(&m)),
            "LOAD_BATCH_SIZE" => self.batch_size.map(|n| n.to_string()),
            "LOG_DIR" => self.log_dir.as_ref().map(|p| p.display().to_string()),
            _ => None,
        }
    }
}

fn enum_name<T: ValueEnum>(value: &T) -> Option<String> {
    value.to_possible_value().map(|v| v.get_name().to_string())
}
