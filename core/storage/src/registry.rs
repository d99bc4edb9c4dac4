//! Remote store registry for resolving a backend from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use tandem_common::{Error, Result};

use crate::credentials::CredentialProvider;
use crate::remote::RemoteStore;

/// Factory function type for creating remote stores.
pub type RemoteFactory = Box<
    dyn Fn(Value, Arc<dyn CredentialProvider>) -> Result<Arc<dyn RemoteStore>> + Send + Sync,
>;

/// Registry for remote store factories.
///
/// Allows dynamic registration and resolution of remote backends by name
/// and configuration.
pub struct StoreRegistry {
    factories: HashMap<String, RemoteFactory>,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a remote store factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: RemoteFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Remote store '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a remote store by name and configuration.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid for the backend
    pub fn resolve(
        &self,
        name: &str,
        config: Value,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<dyn RemoteStore>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!("Remote store '{}' is not registered", name))
        })?;
        factory(config, credentials)
    }

    /// Get list of registered backend names.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends: `memory` and `http`.
pub fn create_default_registry() -> StoreRegistry {
    let mut factories: HashMap<String, RemoteFactory> = HashMap::new();

    factories.insert(
        "memory".to_string(),
        Box::new(|_config, _credentials| Ok(Arc::new(crate::memory::MemoryRemoteStore::new()))),
    );
    factories.insert(
        "http".to_string(),
        Box::new(|config, credentials| crate::http::create_http_store(config, credentials)),
    );

    StoreRegistry { factories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::memory::MemoryRemoteStore;

    fn creds() -> Arc<dyn CredentialProvider> {
        Arc::new(StaticCredentials::new(Some("token".to_string())))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();

        registry
            .register("test", Box::new(|_, _| Ok(Arc::new(MemoryRemoteStore::new()))))
            .unwrap();

        let store = registry.resolve("test", Value::Null, creds()).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();

        registry
            .register("test", Box::new(|_, _| Ok(Arc::new(MemoryRemoteStore::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_, _| Ok(Arc::new(MemoryRemoteStore::new()))));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StoreRegistry::new();
        assert!(registry.resolve("unknown", Value::Null, creds()).is_err());
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        assert_eq!(registry.stores(), vec!["http".to_string(), "memory".to_string()]);

        let http = registry
            .resolve(
                "http",
                serde_json::json!({"base_url": "https://sync.example.com/api"}),
                creds(),
            )
            .unwrap();
        assert_eq!(http.name(), "http");
    }
}
