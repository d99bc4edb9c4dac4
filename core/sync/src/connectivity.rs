//! Shared view of whether the remote store is worth calling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use tandem_store::CredentialProvider;

/// Credential presence plus the last observed reachability.
///
/// The engine's health probe and every failed remote call update the
/// reachability flag; repositories consult [`Connectivity::is_online`]
/// before touching the network.
pub struct Connectivity {
    credentials: Arc<dyn CredentialProvider>,
    reachable: AtomicBool,
}

impl Connectivity {
    /// Starts optimistic: reachable until a call says otherwise.
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            credentials,
            reachable: AtomicBool::new(true),
        }
    }

    /// Whether a non-empty access token is available right now.
    pub async fn has_credential(&self) -> bool {
        matches!(self.credentials.access_token().await, Some(token) if !token.is_empty())
    }

    /// Signed in and not known to be unreachable.
    pub async fn is_online(&self) -> bool {
        self.reachable.load(Ordering::SeqCst) && self.has_credential().await
    }

    pub fn mark_reachable(&self) {
        if !self.reachable.swap(true, Ordering::SeqCst) {
            info!("Remote store reachable again");
        }
    }

    pub fn mark_unreachable(&self, reason: &str) {
        if self.reachable.swap(false, Ordering::SeqCst) {
            debug!("Remote store marked unreachable: {}", reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_store::StaticCredentials;

    #[tokio::test]
    async fn test_online_requires_credential_and_reachability() {
        let creds = Arc::new(StaticCredentials::new(None));
        let connectivity = Connectivity::new(creds.clone());
        assert!(!connectivity.is_online().await);

        creds.set_token("abc");
        assert!(connectivity.is_online().await);

        connectivity.mark_unreachable("probe failed");
        assert!(!connectivity.is_online().await);
        assert!(connectivity.has_credential().await);

        connectivity.mark_reachable();
        assert!(connectivity.is_online().await);

        creds.clear();
        assert!(!connectivity.is_online().await);
    }
}
