//! In-process shared storage with per-peer views
//!
//! [`SharedMemory`] is the storage itself; each peer opens its own
//! [`MemoryBackend`] view with [`SharedMemory::connect`]. A write through one
//! view notifies every other view, mirroring how browser tabs observe each
//! other's `localStorage` writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

use crate::NOTIFY_CHANNEL_CAPACITY;
use crate::backend::{KvBackend, StoreChange};
use crate::error::StoreError;

struct ViewSlot {
    id: u64,
    tx: broadcast::Sender<StoreChange>,
}

struct Shared {
    data: Mutex<BTreeMap<String, String>>,
    views: Mutex<Vec<ViewSlot>>,
    next_view: AtomicU64,
    /// Deliver notifications without the changed key
    keyless: bool,
}

/// Storage shared by every view connected to it
#[derive(Clone)]
pub struct SharedMemory {
    shared: Arc<Shared>,
}

impl SharedMemory {
    /// Storage whose notifications name the changed key
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Storage whose notifications never carry the changed key
    pub fn keyless() -> Self {
        Self::build(true)
    }

    fn build(keyless: bool) -> Self {
        debug!(keyless, "SharedMemory::new: called");
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(BTreeMap::new()),
                views: Mutex::new(Vec::new()),
                next_view: AtomicU64::new(1),
                keyless,
            }),
        }
    }

    /// Open a new peer view onto this storage
    pub fn connect(&self) -> MemoryBackend {
        let id = self.shared.next_view.fetch_add(1, Ordering::Relaxed);
        let (tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        if let Ok(mut views) = self.shared.views.lock() {
            views.push(ViewSlot { id, tx: tx.clone() });
        }
        debug!(view_id = id, "SharedMemory::connect: view opened");
        MemoryBackend {
            shared: self.shared.clone(),
            view_id: id,
            tx,
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.shared.data.lock().map(|data| data.clone()).unwrap_or_default()
    }

    /// Write directly, notifying every view (an outside writer)
    pub fn set_external(&self, key: &str, value: &str) {
        if let Ok(mut data) = self.shared.data.lock() {
            data.insert(key.to_string(), value.to_string());
        }
        self.shared.notify(0, key);
    }
}

impl Default for SharedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn notify(&self, writer: u64, key: &str) {
        let change = if self.keyless {
            StoreChange::unknown()
        } else {
            StoreChange::key(key)
        };
        let Ok(views) = self.views.lock() else {
            return;
        };
        for slot in views.iter().filter(|slot| slot.id != writer) {
            // No subscribers on that view is fine
            let _ = slot.tx.send(change.clone());
        }
    }
}

/// One peer's view onto a [`SharedMemory`]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    view_id: u64,
    tx: broadcast::Sender<StoreChange>,
}

impl MemoryBackend {
    /// Identifier of this view, unique within its storage
    pub fn view_id(&self) -> u64 {
        self.view_id
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let data = self.shared.data.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let changed = {
            let mut data = self.shared.data.lock().map_err(|_| StoreError::Poisoned)?;
            data.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        };
        if changed {
            self.shared.notify(self.view_id, key);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let removed = {
            let mut data = self.shared.data.lock().map_err(|_| StoreError::Poisoned)?;
            data.remove(key).is_some()
        };
        if removed {
            self.shared.notify(self.view_id, key);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let data = self.shared.data.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(data.keys().cloned().collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Ok(mut views) = self.shared.views.lock() {
            views.retain(|slot| slot.id != self.view_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_views_share_data() {
        let shared = SharedMemory::new();
        let a = shared.connect();
        let b = shared.connect();

        a.set("k", "v").unwrap();
        assert_eq!(b.get("k").unwrap().as_deref(), Some("v"));

        b.remove("k").unwrap();
        assert_eq!(a.get("k").unwrap(), None);
        assert!(shared.snapshot().is_empty());
    }

    #[test]
    fn test_writer_is_not_notified() {
        let shared = SharedMemory::new();
        let a = shared.connect();
        let b = shared.connect();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.set("k", "v").unwrap();

        assert_eq!(b_rx.try_recv().unwrap(), StoreChange::key("k"));
        assert!(matches!(a_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_unchanged_writes_do_not_notify() {
        let shared = SharedMemory::new();
        let a = shared.connect();
        let b = shared.connect();
        let mut b_rx = b.subscribe();

        a.set("k", "v").unwrap();
        a.set("k", "v").unwrap();
        a.remove("missing").unwrap();

        assert!(b_rx.try_recv().is_ok());
        assert!(matches!(b_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_keyless_notifications() {
        let shared = SharedMemory::keyless();
        let a = shared.connect();
        let b = shared.connect();
        let mut b_rx = b.subscribe();

        a.set("k", "v").unwrap();
        assert_eq!(b_rx.try_recv().unwrap(), StoreChange::unknown());
    }

    #[test]
    fn test_external_writer_notifies_everyone() {
        let shared = SharedMemory::new();
        let a = shared.connect();
        let mut a_rx = a.subscribe();

        shared.set_external("k", "v");
        assert_eq!(a_rx.try_recv().unwrap(), StoreChange::key("k"));
        assert_eq!(a.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_dropped_view_is_forgotten() {
        let shared = SharedMemory::new();
        let a = shared.connect();
        let b = shared.connect();
        drop(b);

        a.set("k", "v").unwrap();
        assert_eq!(shared.shared.views.lock().unwrap().len(), 1);
    }
}
