mod alerts;
mod batch;
mod bootstrap;
mod config;
mod controller;
mod etag;
mod heartbeats;
mod ledger;
mod peer;
mod prefetch;
mod resolver;
mod stats;
mod store;
#[cfg(test)]
mod testing;
mod types;
mod work;
mod worker;

use alerts::LogAlerts;
use bootstrap::BootstrapArtifact;
use clap::Parser;
use config::RelayConfig;
use controller::ReplicationController;
use eyre::{eyre, Result};
use peer::PeerClient;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use store::{MemoryStore, Store};
use work::WorkContext;

use fs2::FileExt;

#[derive(Parser, Debug)]
#[command(
    name = "docrelay",
    version,
    about = "Replication keeper: pushes newly written documents and attachments to peer database endpoints"
)]
struct Args {
    /// Path to the bootstrap artifact JSON (database id, local url,
    /// initial destinations).
    #[arg(long, default_value = "config/relay.json")]
    bootstrap: PathBuf,

    /// Override this node's public URL. If omitted, uses
    /// DOCRELAY_LOCAL_URL or bootstrap.localUrl.
    #[arg(long)]
    local_url: Option<String>,

    /// How long to wait for a work notification before ticking anyway.
    #[arg(long, default_value_t = 30)]
    work_wait_seconds: u64,

    /// Guarantee an unfiltered replication pass at least this often.
    #[arg(long, default_value_t = 300)]
    full_pass_seconds: u64,

    /// Dispose a destination's prefetcher after it has been failing
    /// continuously for this long.
    #[arg(long, default_value_t = 180)]
    failure_gc_seconds: u64,

    /// HTTP timeout for peer calls.
    #[arg(long, default_value_t = 60)]
    http_timeout_seconds: u64,

    /// Run a single replication pass and exit.
    #[arg(long)]
    once: bool,

    /// Check every destination every pass, ignoring the persisted
    /// failure throttle.
    ///
    /// Useful for debugging. Not recommended for normal operation.
    #[arg(long)]
    ignore_failure_throttle: bool,

    /// Where to place the single-instance lock file. Defaults to the
    /// bootstrap path with a .lock extension.
    #[arg(long)]
    lock_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let artifact = BootstrapArtifact::load(&args.bootstrap)?;

    let local_url = args
        .local_url
        .or_else(|| std::env::var("DOCRELAY_LOCAL_URL").ok())
        .or_else(|| artifact.local_url.clone())
        .ok_or_else(|| {
            eyre!("no local url provided. pass --local-url, set DOCRELAY_LOCAL_URL, or include localUrl in the bootstrap artifact")
        })?;

    let config = RelayConfig::from_cli(
        local_url,
        args.work_wait_seconds,
        args.full_pass_seconds,
        args.failure_gc_seconds,
        args.http_timeout_seconds,
        args.once,
        args.ignore_failure_throttle,
    )?;

    // Single-instance guard: lock next to the bootstrap artifact. Two
    // keepers pushing with the same identity would fight over cursors.
    let lock_path = args
        .lock_file
        .unwrap_or_else(|| args.bootstrap.with_extension("lock"));
    if let Some(parent) = lock_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("failed to create lock directory {}: {e}", parent.display()))?;
        }
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", lock_path.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "keeper already running or lock unavailable ({}): {e}",
            lock_path.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    tracing::info!(
        database_id = %artifact.database_id,
        local_url = %config.local_url,
        once = config.once,
        ignore_failure_throttle = config.ignore_failure_throttle,
        "keeper starting"
    );

    let store = Arc::new(MemoryStore::new(artifact.database_id.clone()));
    if let Some(destinations) = artifact.destinations.clone() {
        store.put(
            types::DESTINATIONS_DOC,
            None,
            destinations,
            serde_json::json!({}),
        )?;
    }

    let work = Arc::new(WorkContext::new());
    {
        let work = work.clone();
        store.set_write_hook(move || work.notify_about_work());
    }

    let peer = Arc::new(PeerClient::new(
        config.local_url.clone(),
        artifact.database_id.clone(),
        config.http_timeout,
        work.cancellation_token(),
    )?);

    let controller = ReplicationController::new(
        store,
        peer,
        config,
        work.clone(),
        Arc::new(LogAlerts),
    );

    {
        let work = work.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
                work.shutdown();
            }
        });
    }

    controller.run().await;

    Ok(())
}
