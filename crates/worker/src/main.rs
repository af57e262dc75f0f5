use arrow::util::pretty::pretty_format_batches;
use clap::Parser;
use igloo_dispatch::ConnectorManager;
use igloo_worker::{run_scan, scan_request, WorkerError, WorkerSettings};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "igloo-worker", about = "Run a SQL scan over CSV files through the connector dispatch core")]
struct Cli {
    /// Worker configuration file. Defaults to WORKER_CONFIG_PATH or crates/worker/config/default.toml.
    #[arg(long)]
    config: Option<String>,

    /// Overrides `data_dir` from the configuration.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// The SELECT statement to run.
    sql: String,
}

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = WorkerSettings::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }
    info!(data_dir = %settings.data_dir.display(), fetch_size = settings.fetch_size, "worker starting");

    let manager = ConnectorManager::new(settings.dispatch.clone())?;
    let query_id = format!("worker-{}", std::process::id());
    let request = scan_request(&settings, &query_id, &cli.sql)?;

    let result = tokio::select! {
        result = run_scan(&manager, request) => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, cancelling scan");
            Err(WorkerError::Cancelled(query_id))
        }
    };
    manager.shutdown().await;

    let batches = result?;
    println!("{}", pretty_format_batches(&batches)?);
    Ok(())
}
