//! KvStore - infallible facade over a backend

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::{KvBackend, StoreChange};
use crate::null::NullBackend;

/// Handle to a shared key-value store
///
/// Backend failures are logged and absorbed: a failed read looks like a
/// missing key, a failed write is dropped. Cloning is cheap.
#[derive(Clone)]
pub struct KvStore {
    backend: Arc<dyn KvBackend>,
}

impl KvStore {
    /// Wrap a backend
    pub fn new(backend: impl KvBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Wrap an already shared backend
    pub fn from_arc(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// A store with no backing storage: every operation is a no-op
    pub fn unavailable() -> Self {
        debug!("KvStore::unavailable: called");
        Self::new(NullBackend::new())
    }

    /// Whether a real backing store is present
    pub fn is_available(&self) -> bool {
        self.backend.is_available()
    }

    /// Read a value, `None` if missing or unreadable
    pub fn get(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(%key, error = %e, transient = e.is_transient(), "KvStore::get: read failed, treating as absent");
                None
            }
        }
    }

    /// Write a value; failures are logged and dropped
    pub fn set(&self, key: &str, value: &str) {
        if let Err(e) = self.backend.set(key, value) {
            warn!(%key, error = %e, transient = e.is_transient(), "KvStore::set: write failed");
        }
    }

    /// Delete a key; failures are logged and dropped
    pub fn remove(&self, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            warn!(%key, error = %e, transient = e.is_transient(), "KvStore::remove: delete failed");
        }
    }

    /// List keys, empty on failure
    pub fn keys(&self) -> Vec<String> {
        self.backend.keys().unwrap_or_else(|e| {
            warn!(error = %e, "KvStore::keys: listing failed");
            Vec::new()
        })
    }

    /// Subscribe to changes made by other peers
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.backend.subscribe()
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("available", &self.is_available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    struct FailingBackend {
        tx: broadcast::Sender<StoreChange>,
    }

    impl KvBackend for FailingBackend {
        fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn remove(&self, _key: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
        fn keys(&self) -> Result<Vec<String>, StoreError> {
            Err(StoreError::Poisoned)
        }
        fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
            self.tx.subscribe()
        }
    }

    #[test]
    fn test_failures_are_absorbed() {
        let (tx, _) = broadcast::channel(4);
        let store = KvStore::new(FailingBackend { tx });

        store.set("k", "v");
        store.remove("k");
        assert_eq!(store.get("k"), None);
        assert!(store.keys().is_empty());
        assert!(store.is_available());
    }

    #[test]
    fn test_unavailable_store() {
        let store = KvStore::unavailable();
        assert!(!store.is_available());

        store.set("k", "v");
        assert_eq!(store.get("k"), None);
    }
}
