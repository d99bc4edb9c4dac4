//! Authenticated HTTP backend for the remote store.
//!
//! Talks to the sync server's REST API:
//! - `/data/{type}[/{id}|/count]` for per-entity CRUD
//! - `/sync/health`, `/sync/batch` and `/sync/changes` for the sync engine
//!
//! Every request carries a bearer token from a [`CredentialProvider`] and a
//! client-level timeout.

pub mod client;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tandem_common::{Error, Result};

use crate::credentials::CredentialProvider;
use crate::remote::RemoteStore;

pub use client::HttpRemoteStore;

/// Default request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Configuration for the HTTP remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRemoteConfig {
    /// API root, e.g. `https://sync.example.com/api/`.
    pub base_url: String,
    /// Per-request timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl HttpRemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Build an HTTP remote store from a JSON configuration.
///
/// # Errors
/// - Configuration is not a valid [`HttpRemoteConfig`]
/// - `base_url` does not parse
pub fn create_http_store(
    config: serde_json::Value,
    credentials: Arc<dyn CredentialProvider>,
) -> Result<Arc<dyn RemoteStore>> {
    let config: HttpRemoteConfig = serde_json::from_value(config)
        .map_err(|e| Error::InvalidInput(format!("Invalid http remote config: {}", e)))?;
    Ok(Arc::new(HttpRemoteStore::new(config, credentials)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;

    #[test]
    fn test_config_defaults() {
        let config: HttpRemoteConfig =
            serde_json::from_value(serde_json::json!({"base_url": "http://localhost"})).unwrap();
        assert_eq!(config.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let creds: Arc<dyn CredentialProvider> = Arc::new(StaticCredentials::new(None));
        assert!(create_http_store(serde_json::json!({}), creds.clone()).is_err());
        assert!(create_http_store(serde_json::json!({"base_url": "not a url"}), creds).is_err());
    }
}
