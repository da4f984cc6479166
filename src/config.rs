//! Engine configuration.
//!
//! Values are layered: built-in defaults, then `local_settings` rows in the
//! `sync` category, then `POS_*` environment variables. Unparseable values
//! are logged and skipped.

use rusqlite::Connection;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::db::{get_setting, LocalDb};
use crate::error::StoreError;

pub const SETTINGS_CATEGORY: &str = "sync";

const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 50;

const SECS_PER_DAY: u64 = 24 * 60 * 60;
/// Keeps purge cutoffs well inside the representable date range.
pub const MAX_RETENTION_DAYS: u64 = 365 * 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineConfig {
    /// Pause between sync cycles.
    pub sync_interval: Duration,
    /// Max cash sessions replicated per cycle.
    pub sync_batch_size: usize,
    /// Pause between purge cycles. A purge also runs once at startup.
    pub purge_interval: Duration,
    /// Synced rows older than this are purged.
    pub retention: Duration,
    pub remote_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            sync_batch_size: MAX_BATCH,
            purge_interval: Duration::from_secs(24 * 60 * 60),
            retention: Duration::from_secs(2 * 24 * 60 * 60),
            remote_timeout: Duration::from_secs(30),
        }
    }
}

/// Retention window for `days`, or `None` past [`MAX_RETENTION_DAYS`].
fn retention_from_days(days: u64) -> Option<Duration> {
    if days > MAX_RETENTION_DAYS {
        return None;
    }
    days.checked_mul(SECS_PER_DAY).map(Duration::from_secs)
}

fn parse<T: FromStr>(source: &str, key: &str, raw: &str) -> Option<T> {
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(source, key, value = raw, "Ignoring unparseable sync setting");
            None
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with stored settings and the environment.
    pub fn load(db: &LocalDb) -> Result<Self, StoreError> {
        let mut config = Self::default();
        {
            let conn = db.lock()?;
            config.apply_settings(&conn);
        }
        config.apply_env();
        debug!(?config, "Engine configuration resolved");
        Ok(config)
    }

    fn apply(&mut self, source: &str, lookup: impl Fn(&str) -> Option<String>) {
        let read = |key: &str| lookup(key).and_then(|v| parse::<u64>(source, key, &v));

        if let Some(secs) = read("interval_secs") {
            self.sync_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(size) = read("batch_size") {
            self.sync_batch_size = usize::try_from(size).unwrap_or(MAX_BATCH);
        }
        if let Some(secs) = read("purge_interval_secs") {
            self.purge_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(days) = read("retention_days") {
            match retention_from_days(days) {
                Some(retention) => self.retention = retention,
                None => warn!(source, days, "Ignoring out-of-range retention_days"),
            }
        }
        self.sync_batch_size = self.sync_batch_size.clamp(MIN_BATCH, MAX_BATCH);
    }

    pub fn apply_settings(&mut self, conn: &Connection) {
        self.apply("local_settings", |key| get_setting(conn, SETTINGS_CATEGORY, key));
    }

    pub fn apply_env(&mut self) {
        self.apply("env", |key| {
            let var = match key {
                "interval_secs" => "POS_SYNC_INTERVAL_SECS",
                "batch_size" => "POS_SYNC_BATCH_SIZE",
                "purge_interval_secs" => "POS_PURGE_INTERVAL_SECS",
                "retention_days" => "POS_RETENTION_DAYS",
                _ => return None,
            };
            std::env::var(var).ok()
        });
    }

    /// Retention as a chrono duration, for cutoff timestamps.
    pub fn retention_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(2))
    }
}
