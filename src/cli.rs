//! Command-line argument parsing for batchq.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use db_batchq::config::{Config, DispatchConfig};
use db_batchq::error::{BatchError, Result};
use db_batchq::query::PartialQueryPayload;

/// Expands a batch query payload, runs every unit and streams the merged
/// results as NDJSON.
#[derive(Parser, Debug)]
#[command(name = "batchq")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// JSON payload file (reads stdin when omitted or "-")
    #[arg(value_name = "PAYLOAD")]
    pub payload: Option<PathBuf>,

    /// Config file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Maximum number of simultaneously in-flight target calls
    #[arg(short = 'w', long, value_name = "N", env = "BATCHQ_WORKERS")]
    pub workers: Option<usize>,

    /// Per-unit timeout in milliseconds
    #[arg(short = 't', long, value_name = "MS", env = "BATCHQ_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Answer every target id with generated rows instead of connecting
    #[arg(long)]
    pub mock_targets: bool,

    /// Write the batch manifest to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// Keep query records in memory only
    #[arg(long)]
    pub in_memory: bool,

    /// Write logs to the state directory instead of stderr
    #[arg(long)]
    pub log_file: bool,
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Returns the config file path to use.
    pub fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(Config::default_path)
    }

    /// Loads the config file and applies command-line overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load_from_file(&self.config_path())?;
        self.apply_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies `--workers`, `--timeout-ms` and `--in-memory`.
    pub fn apply_overrides(&self, config: &mut Config) -> Result<()> {
        let workers = self.workers.unwrap_or(config.dispatch.workers);
        let timeout = self
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.dispatch.unit_timeout());
        let dispatch = DispatchConfig::new(workers, timeout);
        dispatch.validate()?;
        config.dispatch = dispatch;

        if self.in_memory {
            config.state.in_memory = true;
        }
        Ok(())
    }

    /// Reads and parses the payload from the file argument or stdin.
    pub fn read_payload(&self) -> Result<PartialQueryPayload> {
        let json = match self.payload.as_deref() {
            Some(path) if path != Path::new("-") => std::fs::read_to_string(path).map_err(|e| {
                BatchError::config(format!(
                    "Failed to read payload {}: {e}",
                    path.display()
                ))
            })?,
            _ => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .map_err(|e| BatchError::config(format!("Failed to read stdin: {e}")))?;
                buf
            }
        };
        PartialQueryPayload::from_json(&json)
    }
}
