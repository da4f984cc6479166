//! Central sync API client.
//!
//! Posts replication payloads to the admin dashboard's sync endpoints. The
//! server applies each aggregate in a single database transaction and
//! resolves rows by `origin_key`, mirroring the SQLite driver.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::RemoteStore;
use crate::error::RemoteError;
use crate::model::{AggregatePayload, RemoteLocation, RemoteOperator, ReplicationReceipt};

/// Bodies above this size are sent zstd-compressed.
const COMPRESS_THRESHOLD: usize = 8 * 1024;

/// Timeout used for the lightweight health check.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

/// Normalise the sync API base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// Map a transport error to a remote error with a readable message.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Unreachable(format!("Cannot reach sync API at {url}"));
    }
    if err.is_timeout() {
        return RemoteError::Unreachable(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return RemoteError::Rejected(format!("Invalid sync API URL: {url}"));
    }
    RemoteError::Unreachable(format!("Network error communicating with {url}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Location not authorized".to_string(),
        404 => "Sync endpoint not found".to_string(),
        409 => "Conflicting row on central store".to_string(),
        s if s >= 500 => format!("Sync API server error (HTTP {s})"),
        s => format!("Unexpected response from sync API (HTTP {s})"),
    }
}

/// Server errors mean the central transaction did not commit; client errors
/// mean the payload itself was refused.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_message(status));
    let detail = format!("{message} (HTTP {})", status.as_u16());
    if status.is_server_error() {
        RemoteError::Transaction(detail)
    } else {
        RemoteError::Rejected(detail)
    }
}

/// Serialize a request body, compressing it when large.
/// Returns the bytes and whether they are zstd-encoded.
fn encode_body<T: Serialize>(body: &T) -> Result<(Vec<u8>, bool), RemoteError> {
    let json = serde_json::to_vec(body)
        .map_err(|e| RemoteError::Rejected(format!("Failed to encode payload: {e}")))?;
    if json.len() <= COMPRESS_THRESHOLD {
        return Ok((json, false));
    }
    let compressed = zstd::stream::encode_all(Cursor::new(json), 0)
        .map_err(|e| RemoteError::Rejected(format!("Failed to compress payload: {e}")))?;
    Ok((compressed, true))
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    #[serde(alias = "id")]
    remote_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Wrapped { data } => data,
            Envelope::Bare(inner) => inner,
        }
    }
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let base_url = normalize_base_url(base_url);
        if api_key.trim().is_empty() {
            return Err(RemoteError::Rejected("Missing sync API key".into()));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unreachable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_key: Zeroizing::new(api_key.trim().to_string()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B, R>(
        &self,
        path: &str,
        idempotency_key: &str,
        body: &B,
    ) -> Result<R, RemoteError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let (bytes, compressed) = encode_body(body)?;
        let size = bytes.len();

        let mut req = self
            .client
            .post(&url)
            .header("X-POS-API-Key", self.api_key.as_str())
            .header("Idempotency-Key", idempotency_key)
            .header("Content-Type", "application/json");
        if compressed {
            req = req.header("Content-Encoding", "zstd");
        }

        let resp = req
            .body(bytes)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        debug!(path, bytes = size, compressed, "Sync API request accepted");

        serde_json::from_str::<Envelope<R>>(&text)
            .map(Envelope::into_inner)
            .map_err(|e| RemoteError::Decode(format!("{path}: {e}")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn ping(&self) -> Result<(), RemoteError> {
        let start = Instant::now();
        let resp = self
            .client
            .get(format!("{}/api/health", self.base_url))
            .header("X-POS-API-Key", self.api_key.as_str())
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RemoteError::Unreachable(status_message(status)));
        }
        debug!(latency_ms = start.elapsed().as_millis() as u64, "Sync API reachable");
        Ok(())
    }

    async fn upsert_location(&self, location: &RemoteLocation) -> Result<i64, RemoteError> {
        let resp: UpsertResponse = self
            .post("/api/pos/sync/locations", &location.origin_key, location)
            .await?;
        Ok(resp.remote_id)
    }

    async fn upsert_operator(&self, operator: &RemoteOperator) -> Result<i64, RemoteError> {
        let resp: UpsertResponse = self
            .post("/api/pos/sync/operators", &operator.origin_key, operator)
            .await?;
        Ok(resp.remote_id)
    }

    async fn replicate_aggregate(
        &self,
        payload: &AggregatePayload,
    ) -> Result<ReplicationReceipt, RemoteError> {
        let receipt: ReplicationReceipt = self
            .post(
                "/api/pos/sync/cash-sessions",
                &payload.session.origin_key,
                payload,
            )
            .await?;
        if !receipt.assigned.contains_key(&payload.session.origin_key) {
            return Err(RemoteError::Decode(
                "receipt does not include the cash session".into(),
            ));
        }
        info!(
            session = %payload.session.origin_key,
            rows = receipt.assigned.len(),
            "Aggregate accepted by sync API"
        );
        Ok(receipt)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
