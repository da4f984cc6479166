//! Remote (central, authoritative) store drivers.
//!
//! Only the sync daemon talks to a remote store. Every upsert resolves the
//! target row by known remote id, then by `origin_key`, and inserts only when
//! neither matches, so re-sending a payload never duplicates rows.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::error::RemoteError;
use crate::model::{AggregatePayload, RemoteLocation, RemoteOperator, ReplicationReceipt};
use crate::storage::RemoteCredentials;

pub mod http;
pub mod sqlite;

pub use http::HttpRemoteStore;
pub use sqlite::SqliteRemoteStore;

/// A central store reachable by the sync daemon.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Cheap reachability check, run before each Sending phase.
    async fn ping(&self) -> Result<(), RemoteError>;

    /// Insert or update a location; returns its remote id.
    async fn upsert_location(&self, location: &RemoteLocation) -> Result<i64, RemoteError>;

    /// Insert or update an operator; returns its remote id.
    async fn upsert_operator(&self, operator: &RemoteOperator) -> Result<i64, RemoteError>;

    /// Apply a cash session and its subtree in one remote transaction.
    /// Either every row is applied or none is.
    async fn replicate_aggregate(
        &self,
        payload: &AggregatePayload,
    ) -> Result<ReplicationReceipt, RemoteError>;

    /// Driver name for logs and status.
    fn name(&self) -> &'static str;
}

/// Build a remote store from credentials. Nothing is sent until the first
/// sync cycle; an unreachable host surfaces later as `RemoteError::Unreachable`.
pub fn connect(
    credentials: &RemoteCredentials,
    timeout: Duration,
) -> Result<Arc<dyn RemoteStore>, RemoteError> {
    let store: Arc<dyn RemoteStore> = match credentials {
        RemoteCredentials::Http { url, api_key } => {
            Arc::new(HttpRemoteStore::new(url, api_key, timeout)?)
        }
        RemoteCredentials::Sqlite { path } => Arc::new(SqliteRemoteStore::open(path)?),
    };
    info!(driver = store.name(), "Remote store configured");
    Ok(store)
}
