//! Backend used when no storage is available

use tokio::sync::broadcast;

use crate::NOTIFY_CHANNEL_CAPACITY;
use crate::backend::{KvBackend, StoreChange};
use crate::error::StoreError;

/// Storage that stores nothing and never notifies
pub struct NullBackend {
    tx: broadcast::Sender<StoreChange>,
}

impl NullBackend {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl KvBackend for NullBackend {
    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn remove(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }

    fn is_available(&self) -> bool {
        false
    }
}
