//! Remote connection settings in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Settings arrive as a connection
//! string (plain JSON or base64url-encoded JSON) handed out by the admin
//! dashboard during onboarding.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use tracing::{info, warn};
use zeroize::Zeroize;

const SERVICE_NAME: &str = "pos-sync";

const KEY_CONNECTION: &str = "remote_connection";

/// How to reach the central store.
#[derive(Clone, PartialEq, Eq)]
pub enum RemoteCredentials {
    Http { url: String, api_key: String },
    Sqlite { path: PathBuf },
}

impl fmt::Debug for RemoteCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { url, .. } => f
                .debug_struct("Http")
                .field("url", url)
                .field("api_key", &"<redacted>")
                .finish(),
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
        }
    }
}

impl Drop for RemoteCredentials {
    fn drop(&mut self) {
        if let Self::Http { api_key, .. } = self {
            api_key.zeroize();
        }
    }
}

// ---------------------------------------------------------------------------
// Connection string decoding
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn non_empty(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a connection string. Accepted shapes:
/// `{"url": "...", "key": "..."}` for the sync API and
/// `{"sqlite": "/path/central.db"}` for a central SQLite file.
/// Returns `None` for anything malformed.
pub fn parse_connection_string(raw: &str) -> Option<RemoteCredentials> {
    let payload = decode_connection_string_payload(raw)?;
    if let Some(path) = non_empty(&payload, &["sqlite", "sqlitePath", "path"]) {
        return Some(RemoteCredentials::Sqlite {
            path: PathBuf::from(path),
        });
    }
    let url = non_empty(&payload, &["url", "adminUrl"])?;
    let api_key = non_empty(&payload, &["key", "apiKey"])?;
    Some(RemoteCredentials::Http { url, api_key })
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not
/// exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

/// Validate and store a connection string received during onboarding.
pub fn save_connection_string(raw: &str) -> Result<(), String> {
    if parse_connection_string(raw).is_none() {
        return Err("Connection string is malformed".to_string());
    }
    set_credential(KEY_CONNECTION, raw.trim())?;
    info!("remote connection settings updated");
    Ok(())
}

/// Stored remote credentials, if present and well-formed.
pub fn load_credentials() -> Option<RemoteCredentials> {
    let mut raw = get_credential(KEY_CONNECTION)?;
    let parsed = parse_connection_string(&raw);
    raw.zeroize();
    if parsed.is_none() {
        warn!("stored connection string is malformed; running offline");
    }
    parsed
}

pub fn clear_credentials() -> Result<(), String> {
    info!("deleting remote connection settings");
    delete_credential(KEY_CONNECTION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base64url(json: &str) -> String {
        BASE64_STANDARD
            .encode(json)
            .replace('+', "-")
            .replace('/', "_")
            .trim_end_matches('=')
            .to_string()
    }

    #[test]
    fn test_parses_plain_json() {
        let creds =
            parse_connection_string(r#"{"url":"https://admin.example.com","key":"k-123"}"#)
                .unwrap();
        assert_eq!(
            creds,
            RemoteCredentials::Http {
                url: "https://admin.example.com".into(),
                api_key: "k-123".into()
            }
        );
    }

    #[test]
    fn test_parses_base64url_sqlite() {
        let encoded = base64url(r#"{"sqlite":"/var/lib/pos/central.db"}"#);
        let creds = parse_connection_string(&encoded).unwrap();
        assert_eq!(
            creds,
            RemoteCredentials::Sqlite {
                path: PathBuf::from("/var/lib/pos/central.db")
            }
        );
    }

    #[test]
    fn test_malformed_strings_are_rejected() {
        assert!(parse_connection_string("").is_none());
        assert!(parse_connection_string("not-a-connection-string-at-all!!").is_none());
        assert!(parse_connection_string(r#"{"url":"https://x"}"#).is_none());
        assert!(parse_connection_string(r#"{"url":"  ","key":"k"}"#).is_none());
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let creds = RemoteCredentials::Http {
            url: "https://admin.example.com".into(),
            api_key: "secret-key".into(),
        };
        let printed = format!("{creds:?}");
        assert!(!printed.contains("secret-key"));
        assert!(printed.contains("redacted"));
    }
}
