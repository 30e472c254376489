//! KvStore - shared string key-value store with change notifications
//!
//! Several peers (tasks, processes) open the same store and read and write
//! plain string values. Every peer can subscribe to change notifications,
//! which are delivered to the *other* peers only, never to the writer.
//!
//! # Architecture
//!
//! ```text
//!   peer A                 peer B                 peer C
//!  KvStore ──┐            KvStore ──┐            KvStore ──┐
//!            │                      │                      │
//!       KvBackend              KvBackend              KvBackend
//!            └──────────────┬───────┴──────────────────────┘
//!                    shared storage
//!           (MemoryBackend views / SQLite file)
//! ```
//!
//! Notifications may omit the changed key (`StoreChange::key == None`). The
//! SQLite backend only knows *that* another connection committed, so all its
//! notifications are keyless; consumers compare values to find out what moved.
//!
//! # Example
//!
//! ```ignore
//! use kvstore::{KvStore, SharedMemory};
//!
//! let shared = SharedMemory::new();
//! let a = KvStore::new(shared.connect());
//! let b = KvStore::new(shared.connect());
//!
//! let mut changes = b.subscribe();
//! a.set("greeting", "hello");
//! assert_eq!(changes.recv().await?.key.as_deref(), Some("greeting"));
//! ```

pub mod cli;
mod adapter;
mod backend;
mod error;
mod memory;
mod null;
mod sqlite;

pub use adapter::KvStore;
pub use backend::{KvBackend, StoreChange};
pub use error::StoreError;
pub use memory::{MemoryBackend, SharedMemory};
pub use null::NullBackend;
pub use sqlite::{DEFAULT_POLL_INTERVAL_MS, SqliteBackend, default_db_path};

/// Capacity of each peer's change notification channel
pub const NOTIFY_CHANNEL_CAPACITY: usize = 256;
