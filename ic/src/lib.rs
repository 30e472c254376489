//! Intercom - broadcast bus for peers sharing one key-value store
//!
//! Peers (tabs, tasks, processes) that share a [`kvstore::KvStore`] exchange
//! named events without any direct channel between them. The store offers no
//! atomic read-modify-write and its change notifications are coalesced and
//! never delivered to the writer, so the bus layers a small protocol on top:
//!
//! - **Transaction runner** ([`Transactor`]): a cooperative, timeout-bounded
//!   lock record that serializes read-modify-write of the shared values.
//! - **Message log** ([`MessageLog`]): packets appended by `emit`, re-read by
//!   every other peer on change, deduplicated by id and high-water mark, and
//!   pruned after a short TTL.
//! - **Once-table** ([`OnceTable`]): a ledger so an action runs on exactly one
//!   peer per key until the entry expires.
//! - **Bindings** ([`binding`]): relay events between the bus and external
//!   transports such as a socket.
//!
//! # Persisted layout
//!
//! ```text
//! intercom       -> [{"id":..,"name":..,"origin":..,"timestamp":..,"payload":..}, ...]
//! intercom_once  -> {"key": first-claim-millis, ...}
//! intercom_lock  -> "1718000000000"   (absent when unlocked)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use intercom::Intercom;
//! use kvstore::{KvStore, SharedMemory};
//! use serde_json::json;
//!
//! let shared = SharedMemory::new();
//! let a = Intercom::new(KvStore::new(shared.connect()));
//! let b = Intercom::new(KvStore::new(shared.connect()));
//!
//! b.on("chat", |payload| println!("got {payload}"));
//! a.emit_with_id("chat", json!("hi"), "m1").await;
//! a.once("init-banner", || println!("only one peer prints this")).await;
//! ```

pub mod binding;
pub mod cli;
pub mod config;
mod bus;
mod emitter;
mod packet;
mod throttle;
mod transaction;

pub use binding::{
    BindOptions, BindTarget, Binding, BindingFactory, BindingRegistry, EventFilter, IdExtractor, Relay, Socket,
    SocketBindingFactory, SocketTarget,
};
pub use bus::{Intercom, WeakIntercom};
pub use config::{BusConfig, Config, StoreConfig};
pub use emitter::{EventEmitter, Handler, HandlerId};
pub use packet::{MessageLog, OnceTable, Packet};
pub use transaction::Transactor;

/// Current wall-clock time in unix milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
