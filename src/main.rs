use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use pos_sync_lib::{config::EngineConfig, db::LocalDb, remote, storage, SyncEngine};

const REMOTE_ENV: &str = "POS_SYNC_REMOTE";

fn resolve_credentials() -> Option<storage::RemoteCredentials> {
    if let Ok(raw) = std::env::var(REMOTE_ENV) {
        match storage::parse_connection_string(&raw) {
            Some(creds) => return Some(creds),
            None => warn!("{REMOTE_ENV} is malformed; falling back to the keyring"),
        }
    }
    storage::load_credentials()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let data_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let _log_guard = pos_sync_lib::init_logging(&data_dir.join("logs"))
        .with_context(|| format!("cannot create log directory under {}", data_dir.display()))?;
    info!("Starting pos-sync v{}", env!("CARGO_PKG_VERSION"));

    let local = Arc::new(
        LocalDb::init(&data_dir)
            .with_context(|| format!("cannot open local store in {}", data_dir.display()))?,
    );
    let config = EngineConfig::load(&local).context("cannot read sync settings")?;

    let remote = match resolve_credentials() {
        Some(creds) => match remote::connect(&creds, config.remote_timeout) {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "Remote store unavailable; running offline");
                None
            }
        },
        None => {
            info!("No remote connection configured; running offline");
            None
        }
    };

    let engine = SyncEngine::configure(local, remote, config);
    engine.start_purge_daemon();
    engine.start_sync_daemon();

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")?;
    info!("Shutdown requested");
    engine.shutdown().await;
    Ok(())
}
