//! Backend trait shared by every storage implementation

use tokio::sync::broadcast;

use crate::error::StoreError;

/// A change notification delivered to peers other than the writer
///
/// `key` is `None` when the backend cannot tell which key changed; several
/// writes may also be coalesced into a single notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreChange {
    pub key: Option<String>,
}

impl StoreChange {
    /// Notification naming the key that changed
    pub fn key(key: impl Into<String>) -> Self {
        Self { key: Some(key.into()) }
    }

    /// Notification that something changed, key unknown
    pub fn unknown() -> Self {
        Self { key: None }
    }
}

/// Persistent, peer-shared, string-keyed storage
///
/// Implementations must be cheap per call: the bus performs every operation
/// while holding its cross-peer lock.
pub trait KvBackend: Send + Sync {
    /// Read the raw value stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, replacing any previous value
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Delete `key`; deleting a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// List all keys currently stored
    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Subscribe to changes made by other peers
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;

    /// Whether a real backing store is present
    fn is_available(&self) -> bool {
        true
    }
}
