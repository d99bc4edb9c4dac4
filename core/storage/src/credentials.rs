//! Credential providers.

use async_trait::async_trait;
use std::sync::RwLock;

/// Source of the bearer token for remote calls.
///
/// `None` (or an empty token) means "not signed in"; the sync engine treats
/// that as offline rather than as an error.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;
}

/// Credential holder with a token that can be set or cleared at runtime,
/// e.g. on login and logout.
#[derive(Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
}

impl StaticCredentials {
    /// Create a provider holding `token`.
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token.filter(|t| !t.is_empty())),
        }
    }

    /// Replace the stored token.
    pub fn set_token(&self, token: impl Into<String>) {
        let token = token.into();
        let value = if token.is_empty() { None } else { Some(token) };
        match self.token.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }

    /// Forget the stored token.
    pub fn clear(&self) {
        match self.token.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn access_token(&self) -> Option<String> {
        match self.token.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
