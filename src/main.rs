//! batchq - batch query expansion and dispatch.

mod cli;

use std::io::BufWriter;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use cli::Cli;
use db_batchq::config::Config;
use db_batchq::dispatch::BatchManifest;
use db_batchq::logging::{init_file_logging, init_stderr_logging};
use db_batchq::persistence::{QueryRecordStore, QueryStatus, StateDb};
use db_batchq::target::{ConfiguredResolver, MockResolver, TargetResolver};
use db_batchq::{BatchEngine, BatchError};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse_args();

    if cli.log_file {
        init_file_logging();
    } else {
        init_stderr_logging();
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<BatchError>() {
            Some(batch_err) => {
                error!("{}: {e:#}", batch_err.category());
                if batch_err.is_validation() {
                    ExitCode::from(2)
                } else {
                    ExitCode::FAILURE
                }
            }
            None => {
                error!("{e:#}");
                ExitCode::FAILURE
            }
        },
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = cli.load_config()?;
    let payload = cli.read_payload()?;

    let store = open_store(&config).await?;
    let configured =
        (!cli.mock_targets).then(|| Arc::new(ConfiguredResolver::from_config(&config)));
    let resolver: Arc<dyn TargetResolver> = match &configured {
        Some(resolver) => {
            info!("{} configured targets", resolver.len());
            Arc::clone(resolver) as Arc<dyn TargetResolver>
        }
        None => {
            info!("Using mock targets");
            Arc::new(MockResolver::permissive())
        }
    };

    let engine = BatchEngine::from_config(
        &config,
        resolver,
        Arc::clone(&store) as Arc<dyn QueryRecordStore>,
    )?;
    let response = engine.submit(&payload).await?;

    let mut out = BufWriter::new(std::io::stdout());
    let written = response.write_ndjson(&mut out).await;
    if let Some(resolver) = &configured {
        resolver.close().await;
    }
    store.close().await;

    let manifest = written?;
    info!(
        "Batch {} finished: {} succeeded, {} failed, {} timed out",
        manifest.batch_id,
        manifest.count(QueryStatus::Succeeded),
        manifest.count(QueryStatus::Failed),
        manifest.count(QueryStatus::TimedOut)
    );
    write_manifest(&cli, &manifest)
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<StateDb>> {
    let db = if config.state.in_memory {
        StateDb::open_in_memory().await?
    } else {
        match &config.state.path {
            Some(path) => StateDb::open(path).await?,
            None => StateDb::open_default().await?,
        }
    };
    Ok(Arc::new(db))
}

fn write_manifest(cli: &Cli, manifest: &BatchManifest) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(manifest)?;
    match &cli.manifest {
        Some(path) => std::fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write manifest to {}", path.display())),
        None => {
            eprintln!("{json}");
            Ok(())
        }
    }
}
