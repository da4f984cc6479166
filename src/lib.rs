//! Offline-first dual-write sync engine for point-of-sale locations.
//!
//! Every write lands in the local SQLite store first and is marked stale
//! together with its ancestors. The sync daemon replicates whole cash-session
//! aggregates to the central store, and the purge daemon drops synced rows
//! once they age out of the retention window.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cascade;
pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod locations;
pub mod model;
pub mod movements;
pub mod operators;
pub mod purge;
pub mod remote;
pub mod sales;
pub mod sessions;
pub mod storage;
pub mod sync;
mod write;

pub use config::EngineConfig;
pub use db::LocalDb;
pub use engine::{SyncEngine, SyncStatus};
pub use error::{RemoteError, StoreError, WriteError};
pub use model::{Entity, RowRef};
pub use purge::PurgeReport;
pub use remote::{HttpRemoteStore, RemoteStore, SqliteRemoteStore};
pub use storage::RemoteCredentials;
pub use sync::{CycleReport, SyncPhase};

/// Rolled log files kept on disk.
pub const MAX_LOG_FILES: usize = 10;

const LOG_PREFIX: &str = "pos-sync";

/// Install console + daily rolling file logging under `log_dir`.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the life of the process.
pub fn init_logging(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;
    prune_old_logs(log_dir);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_sync_lib=debug"));

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Keep the newest [`MAX_LOG_FILES`] log files and delete the rest.
pub fn prune_old_logs(log_dir: &Path) {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_PREFIX))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = std::env::temp_dir().join(format!("pos-sync-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let base = SystemTime::now() - Duration::from_secs(3600);
        for i in 0..(MAX_LOG_FILES + 3) {
            let path = dir.join(format!("{LOG_PREFIX}.2026-01-{:02}", i + 1));
            let file = fs::File::create(&path).unwrap();
            file.set_modified(base + Duration::from_secs(i as u64 * 60))
                .unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep").unwrap();

        prune_old_logs(&dir);

        let mut remaining: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), MAX_LOG_FILES + 1);
        assert!(remaining.contains(&"notes.txt".to_string()));
        assert!(!remaining.contains(&format!("{LOG_PREFIX}.2026-01-01")));

        fs::remove_dir_all(&dir).unwrap();
    }
}
