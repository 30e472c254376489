//! Intercom - the broadcast bus
//!
//! Each bus instance is one peer. `emit` appends a packet to the shared log
//! and fires it locally; every other peer gets a store notification, re-reads
//! the log and fires the packets it has not seen yet. All read-modify-write of
//! the shared values happens inside [`Transactor::run_exclusive`].
//!
//! # Receive path
//!
//! ```text
//!   store change ──► listener task ──► log changed? ──yes──► scan task (coalesced)
//!                          │                                      │
//!                          └──► wake lock waiters                 └──► transaction: read log,
//!                                                                      skip own/old/seen, fire
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use kvstore::{KvStore, StoreChange};
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::binding::{BindOptions, BindTarget, Binding, BindingRegistry};
use crate::config::BusConfig;
use crate::emitter::{EventEmitter, HandlerId, Listeners};
use crate::now_ms;
use crate::packet::{MessageLog, OnceTable, Packet};
use crate::throttle::Throttle;
use crate::transaction::Transactor;

/// Callback for the "emitted" meta-event: `(name, payload)`
type EmittedHandler = dyn Fn(&str, &Value) + Send + Sync;

/// Per-peer view of the shared log
struct PeerState {
    /// Packets stamped before this are never delivered
    last_message: i64,
    /// Ids already emitted or delivered by this peer
    received_ids: HashSet<String>,
    /// Last raw value seen per key, for notifications that omit the key
    previous_values: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PruneKind {
    Log,
    Once,
}

struct Inner {
    origin: String,
    store: KvStore,
    config: BusConfig,
    emitter: EventEmitter,
    emitted: Listeners<EmittedHandler>,
    transactor: Transactor,
    wake: Arc<Notify>,
    state: Mutex<PeerState>,
    scan_pending: AtomicBool,
    log_prune: Throttle,
    once_prune: Throttle,
    registry: BindingRegistry,
    bindings: Mutex<Vec<Binding>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let listener = self.listener.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = listener.take() {
            handle.abort();
        }
        debug!(origin = %self.origin, "Intercom: dropped");
    }
}

/// One peer on the shared broadcast bus
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct Intercom {
    inner: Arc<Inner>,
}

/// Non-owning handle to an [`Intercom`]
///
/// Held by background tasks and bindings so they never keep a bus alive.
#[derive(Clone)]
pub struct WeakIntercom {
    inner: Weak<Inner>,
}

impl WeakIntercom {
    pub fn upgrade(&self) -> Option<Intercom> {
        self.inner.upgrade().map(|inner| Intercom { inner })
    }
}

impl Intercom {
    /// Bus with default keys and timings and the default binding factories
    pub fn new(store: KvStore) -> Self {
        Self::with_config(store, BusConfig::default(), BindingRegistry::with_defaults())
    }

    /// Bus with explicit configuration and binding factories
    ///
    /// Must be called inside a tokio runtime to receive other peers' events;
    /// outside one the bus still emits and fires locally.
    pub fn with_config(store: KvStore, config: BusConfig, registry: BindingRegistry) -> Self {
        let origin = Uuid::now_v7().to_string();
        debug!(%origin, log_key = %config.log_key, "Intercom::with_config: called");

        let wake = Arc::new(Notify::new());
        let transactor = Transactor::new(
            store.clone(),
            config.lock_key.clone(),
            config.lock_timeout(),
            config.lock_wait(),
            wake.clone(),
        );

        let bus = Self {
            inner: Arc::new(Inner {
                origin,
                emitter: EventEmitter::new(),
                emitted: Listeners::new(),
                transactor,
                wake,
                state: Mutex::new(PeerState {
                    last_message: now_ms(),
                    received_ids: HashSet::new(),
                    previous_values: HashMap::new(),
                }),
                scan_pending: AtomicBool::new(false),
                log_prune: Throttle::new(config.prune_throttle()),
                once_prune: Throttle::new(config.prune_throttle()),
                registry,
                bindings: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
                store,
                config,
            }),
        };
        bus.spawn_listener();
        bus
    }

    /// Whether `store` can carry messages between peers
    pub fn supported(store: &KvStore) -> bool {
        store.is_available()
    }

    /// Remove every key the bus owns from `store`
    ///
    /// Any peer still running starts over from an empty log and once-table.
    pub fn destroy(store: &KvStore, config: &BusConfig) {
        debug!(available = store.is_available(), "Intercom::destroy: called");
        for key in config.keys() {
            store.remove(key);
        }
    }

    /// This peer's identity, stamped on every packet it writes
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &KvStore {
        &self.inner.store
    }

    pub fn downgrade(&self) -> WeakIntercom {
        WeakIntercom {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- handlers ----

    /// Register a handler for events named `name`, local or remote
    pub fn on(&self, name: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        self.inner.emitter.on(name, handler)
    }

    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        self.inner.emitter.off(name, id)
    }

    /// Watch events this peer emits (not relayed or received ones)
    pub fn on_emitted(&self, handler: impl Fn(&str, &Value) + Send + Sync + 'static) -> HandlerId {
        let handler: Arc<EmittedHandler> = Arc::new(handler);
        self.inner.emitted.add(handler)
    }

    pub fn off_emitted(&self, id: HandlerId) -> bool {
        self.inner.emitted.remove(id)
    }

    /// Watch handler registrations; called with the event name
    pub fn on_handler_registered(&self, watcher: impl Fn(&str) + Send + Sync + 'static) -> HandlerId {
        self.inner.emitter.on_register(watcher)
    }

    pub fn off_handler_registered(&self, id: HandlerId) -> bool {
        self.inner.emitter.off_register(id)
    }

    /// Event names with at least one handler
    pub fn handler_names(&self) -> Vec<String> {
        self.inner.emitter.names()
    }

    // ---- emit path ----

    /// Broadcast an event to every peer, including this one
    pub async fn emit(&self, name: &str, payload: Value) -> bool {
        self.send(name, payload, None, true).await
    }

    /// Broadcast an event at most once per `id` on this peer
    ///
    /// Returns false when the id was already emitted or received here.
    pub async fn emit_with_id(&self, name: &str, payload: Value, id: &str) -> bool {
        self.send(name, payload, Some(id), true).await
    }

    /// Broadcast without firing the "emitted" meta-event
    ///
    /// Used for inbound traffic from a binding, so it is not echoed back out.
    pub async fn relay(&self, name: &str, payload: Value, id: Option<&str>) -> bool {
        self.send(name, payload, id, false).await
    }

    async fn send(&self, name: &str, payload: Value, id: Option<&str>, announce: bool) -> bool {
        debug!(%name, ?id, announce, "Intercom::send: called");
        let id = id.filter(|id| !id.is_empty()).map(str::to_string);
        if let Some(id) = &id {
            let first_sighting = self.state().received_ids.insert(id.clone());
            if !first_sighting {
                debug!(%name, %id, "Intercom::send: duplicate id, dropped");
                return false;
            }
        }

        let inner = &self.inner;
        let log_key = &inner.config.log_key;
        inner
            .transactor
            .run_exclusive(|| {
                let mut log = MessageLog::parse(inner.store.get(log_key).as_deref());
                log.push(Packet::new(name, payload.clone(), inner.origin.as_str(), id, now_ms()));
                self.persist(log_key, log.encode());
                inner.emitter.trigger(name, &payload);
            })
            .await;

        self.schedule_prune(PruneKind::Log);

        if announce {
            for listener in inner.emitted.snapshot() {
                listener(name, &payload);
            }
        }
        true
    }

    /// Write an encoded value
    ///
    /// `previous_values` only tracks values seen on the receive path. An own
    /// write may already contain a remote packet whose notification is still
    /// queued, so caching it here would hide that packet from the next diff.
    fn persist(&self, key: &str, encoded: serde_json::Result<String>) {
        match encoded {
            Ok(encoded) => self.inner.store.set(key, &encoded),
            Err(e) => warn!(%key, error = %e, "Intercom::persist: encoding failed, value not written"),
        }
    }

    // ---- receive path ----

    fn spawn_listener(&self) {
        let Ok(handle) = Handle::try_current() else {
            warn!(origin = %self.inner.origin, "Intercom: no tokio runtime, remote events will not be received");
            return;
        };

        let mut changes = self.inner.store.subscribe();
        let weak = self.downgrade();
        let task = handle.spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Intercom::listener: notifications lagged");
                        StoreChange::unknown()
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(bus) = weak.upgrade() else {
                    break;
                };
                bus.handle_change(&change);
            }
            debug!("Intercom::listener: stopped");
        });

        *self.inner.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn handle_change(&self, change: &StoreChange) {
        if self.log_changed(change) && !self.inner.scan_pending.swap(true, Ordering::AcqRel) {
            let weak = self.downgrade();
            tokio::spawn(async move {
                if let Some(bus) = weak.upgrade() {
                    bus.receive().await;
                }
            });
        }
        self.inner.wake.notify_waiters();
    }

    /// Whether `change` may have touched the log
    fn log_changed(&self, change: &StoreChange) -> bool {
        let log_key = &self.inner.config.log_key;
        if let Some(key) = &change.key {
            return key == log_key;
        }

        let current = self.inner.store.get(log_key);
        let previous = self.state().previous_values.insert(log_key.clone(), current.clone());
        previous != Some(current)
    }

    /// Deliver every log packet this peer has not seen
    ///
    /// Returns the number of packets delivered.
    pub(crate) async fn receive(&self) -> usize {
        let inner = &self.inner;
        let log_key = &inner.config.log_key;
        let delivered = inner
            .transactor
            .run_exclusive(|| {
                inner.scan_pending.store(false, Ordering::Release);
                let raw = inner.store.get(log_key);
                let log = MessageLog::parse(raw.as_deref());

                let fresh: Vec<Packet> = {
                    let mut state = self.state();
                    state.previous_values.insert(log_key.clone(), raw);
                    let mark = state.last_message;
                    let fresh = log
                        .into_iter()
                        .filter(|packet| packet.origin != inner.origin && packet.timestamp >= mark)
                        .filter(|packet| match packet.dedup_id() {
                            Some(id) => state.received_ids.insert(id.to_string()),
                            None => true,
                        })
                        .collect();
                    state.last_message = now_ms();
                    fresh
                };

                for packet in &fresh {
                    inner.emitter.trigger(&packet.name, &packet.payload);
                }
                fresh.len()
            })
            .await;

        debug!(origin = %inner.origin, delivered, "Intercom::receive: scan complete");
        self.schedule_prune(PruneKind::Log);
        delivered
    }

    // ---- once ----

    /// Run `action` on exactly one peer per `key` until the claim expires
    ///
    /// Returns whether this peer claimed the key and ran the action. Never
    /// runs when the store is unavailable.
    pub async fn once<F>(&self, key: &str, action: F) -> bool
    where
        F: FnOnce() + Send,
    {
        debug!(%key, "Intercom::once: called");
        let inner = &self.inner;
        if !inner.store.is_available() {
            debug!(%key, "Intercom::once: store unavailable, not running");
            return false;
        }

        let once_key = &inner.config.once_key;
        let claimed = inner
            .transactor
            .run_exclusive(|| {
                let mut table = OnceTable::parse(inner.store.get(once_key).as_deref());
                if !table.claim(key, now_ms()) {
                    return false;
                }
                match table.encode() {
                    Ok(encoded) => inner.store.set(once_key, &encoded),
                    Err(e) => {
                        warn!(%key, error = %e, "Intercom::once: encoding failed, not running");
                        return false;
                    }
                }
                action();
                true
            })
            .await;

        if claimed {
            info!(%key, origin = %inner.origin, "Intercom::once: claimed");
            self.schedule_prune(PruneKind::Once);
        }
        claimed
    }

    // ---- garbage collection ----

    fn schedule_prune(&self, kind: PruneKind) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let weak = self.downgrade();
        let delay = self.inner.config.prune_delay();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(bus) = weak.upgrade() {
                bus.prune(kind).await;
            }
        });
    }

    /// Drop expired entries; returns how many were removed
    ///
    /// Runs at most once per throttle interval per kind.
    pub(crate) async fn prune(&self, kind: PruneKind) -> usize {
        let inner = &self.inner;
        let throttle = match kind {
            PruneKind::Log => &inner.log_prune,
            PruneKind::Once => &inner.once_prune,
        };
        if !inner.store.is_available() || !throttle.try_begin(now_ms()) {
            return 0;
        }

        let removed = inner
            .transactor
            .run_exclusive(|| {
                let now = now_ms();
                match kind {
                    PruneKind::Log => {
                        let key = &inner.config.log_key;
                        let mut log = MessageLog::parse(inner.store.get(key).as_deref());
                        let removed = log.prune_older_than(now.saturating_sub(ttl_ms(inner.config.emit_ttl_ms)));
                        if removed > 0 {
                            self.persist(key, log.encode());
                        }
                        removed
                    }
                    PruneKind::Once => {
                        let key = &inner.config.once_key;
                        let mut table = OnceTable::parse(inner.store.get(key).as_deref());
                        let removed = table.prune_older_than(now.saturating_sub(ttl_ms(inner.config.once_ttl_ms)));
                        if removed > 0 {
                            self.persist(key, table.encode());
                        }
                        removed
                    }
                }
            })
            .await;

        if removed > 0 {
            debug!(?kind, removed, "Intercom::prune: expired entries removed");
        }
        removed
    }

    // ---- bindings ----

    /// Attach `target` using every factory that applies to it
    ///
    /// Returns how many bindings were created.
    pub fn bind(&self, target: BindTarget, options: BindOptions) -> usize {
        let created: Vec<Binding> = self
            .inner
            .registry
            .iter()
            .filter(|factory| factory.applies_to(&target))
            .filter_map(|factory| factory.create(&target, &options, self))
            .collect();

        let count = created.len();
        for binding in &created {
            info!(kind = binding.kind(), "Intercom::bind: binding attached");
        }
        self.inner.bindings.lock().unwrap_or_else(PoisonError::into_inner).extend(created);
        count
    }

    /// Detach every binding; returns how many were detached
    pub fn unbind_all(&self) -> usize {
        let bindings = std::mem::take(&mut *self.inner.bindings.lock().unwrap_or_else(PoisonError::into_inner));
        for binding in &bindings {
            binding.detach(self);
        }
        debug!(count = bindings.len(), "Intercom::unbind_all: called");
        bindings.len()
    }

    /// Number of bindings currently attached
    pub fn binding_count(&self) -> usize {
        self.inner.bindings.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn ttl_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

impl std::fmt::Debug for Intercom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Intercom")
            .field("origin", &self.inner.origin)
            .field("store", &self.inner.store)
            .field("log_key", &self.inner.config.log_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::SharedMemory;
    use serde_json::json;
    use std::time::Duration;

    fn fast_config() -> BusConfig {
        BusConfig {
            prune_delay_ms: 5,
            prune_throttle_ms: 0,
            ..BusConfig::default()
        }
    }

    fn peer(shared: &SharedMemory) -> Intercom {
        Intercom::with_config(KvStore::new(shared.connect()), fast_config(), BindingRegistry::new())
    }

    fn collect(bus: &Intercom, name: &str) -> Arc<Mutex<Vec<Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(name, move |payload| sink.lock().unwrap().push(payload.clone()));
        seen
    }

    fn stored_log(shared: &SharedMemory) -> MessageLog {
        MessageLog::parse(shared.snapshot().get("intercom").map(String::as_str))
    }

    #[tokio::test]
    async fn test_emit_persists_and_fires_locally() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);
        let seen = collect(&bus, "chat");

        assert!(bus.emit("chat", json!("hi")).await);

        assert_eq!(*seen.lock().unwrap(), vec![json!("hi")]);
        let log = stored_log(&shared);
        assert_eq!(log.len(), 1);
        assert_eq!(log.packets()[0].origin, bus.origin());
        assert_eq!(log.packets()[0].id, None);
        assert!(!shared.snapshot().contains_key("intercom_lock"));
    }

    #[tokio::test]
    async fn test_duplicate_id_appends_once() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);
        let seen = collect(&bus, "chat");

        assert!(bus.emit_with_id("chat", json!("hi"), "m1").await);
        assert!(!bus.emit_with_id("chat", json!("again"), "m1").await);

        assert_eq!(stored_log(&shared).len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_id_is_not_deduplicated() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);

        assert!(bus.emit_with_id("chat", json!(1), "").await);
        assert!(bus.emit_with_id("chat", json!(2), "").await);
        assert_eq!(stored_log(&shared).len(), 2);
    }

    #[tokio::test]
    async fn test_receive_skips_own_old_and_seen_packets() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);
        let seen = collect(&bus, "chat");
        let now = now_ms();

        let mut log = MessageLog::default();
        log.push(Packet::new("chat", json!("mine"), bus.origin(), None, now + 10));
        log.push(Packet::new("chat", json!("old"), "other", None, now - 60_000));
        log.push(Packet::new("chat", json!("new"), "other", Some("x1".into()), now + 10));
        log.push(Packet::new("chat", json!("dup"), "other", Some("x1".into()), now + 11));
        shared.set_external("intercom", &log.encode().unwrap());

        assert_eq!(bus.receive().await, 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!("new")]);

        // Seen ids stay seen
        assert_eq!(bus.receive().await, 0);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_emitted_meta_event_only_for_own_emits() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);
        let announced = Arc::new(Mutex::new(Vec::new()));
        let sink = announced.clone();
        let id = bus.on_emitted(move |name, payload| sink.lock().unwrap().push((name.to_string(), payload.clone())));

        bus.emit("a", json!(1)).await;
        bus.relay("b", json!(2), None).await;
        bus.emit_with_id("c", json!(3), "k").await;
        bus.emit_with_id("c", json!(3), "k").await;
        assert!(bus.off_emitted(id));
        bus.emit("d", json!(4)).await;

        assert_eq!(
            *announced.lock().unwrap(),
            vec![("a".to_string(), json!(1)), ("c".to_string(), json!(3))]
        );
    }

    #[tokio::test]
    async fn test_keyless_change_detection() {
        let shared = SharedMemory::keyless();
        let bus = peer(&shared);

        assert!(bus.log_changed(&StoreChange::unknown()), "first sighting counts as a change");
        assert!(!bus.log_changed(&StoreChange::unknown()));

        shared.set_external("intercom", "[]");
        assert!(bus.log_changed(&StoreChange::unknown()));
        assert!(!bus.log_changed(&StoreChange::unknown()));

        // Own writes are not cached, a keyless notification after one still rescans
        bus.emit("x", json!(null)).await;
        assert!(bus.log_changed(&StoreChange::unknown()));
        assert!(!bus.log_changed(&StoreChange::unknown()));

        assert!(bus.log_changed(&StoreChange::key("intercom")));
        assert!(!bus.log_changed(&StoreChange::key("intercom_lock")));
    }

    #[tokio::test]
    async fn test_keyless_remote_packet_survives_own_emit() {
        let shared = SharedMemory::keyless();
        let a = peer(&shared);
        let b = peer(&shared);
        let seen = collect(&b, "chat");

        a.emit("chat", json!("from a")).await;
        b.emit("other", json!("from b")).await;

        // B's own log now holds A's packet; the pending notification must still rescan
        assert!(b.log_changed(&StoreChange::unknown()));
        b.receive().await;
        assert_eq!(*seen.lock().unwrap(), vec![json!("from a")]);
    }

    #[tokio::test]
    async fn test_once_runs_action_once() {
        let shared = SharedMemory::new();
        let a = peer(&shared);
        let b = peer(&shared);
        let runs = Arc::new(Mutex::new(0));

        let r1 = runs.clone();
        assert!(a.once("init-banner", move || *r1.lock().unwrap() += 1).await);
        let r2 = runs.clone();
        assert!(!b.once("init-banner", move || *r2.lock().unwrap() += 1).await);
        let r3 = runs.clone();
        assert!(!a.once("init-banner", move || *r3.lock().unwrap() += 1).await);

        assert_eq!(*runs.lock().unwrap(), 1);
        let table = OnceTable::parse(shared.snapshot().get("intercom_once").map(String::as_str));
        assert!(table.claimed_at("init-banner").is_some());
    }

    #[tokio::test]
    async fn test_unavailable_store_is_local_only() {
        let bus = Intercom::new(KvStore::unavailable());
        let seen = collect(&bus, "chat");

        assert!(!Intercom::supported(bus.store()));
        assert!(bus.emit("chat", json!("hi")).await);
        assert!(!bus.once("k", || panic!("must not run")).await);
        Intercom::destroy(bus.store(), bus.config());

        assert_eq!(*seen.lock().unwrap(), vec![json!("hi")]);
        assert!(bus.store().keys().is_empty());
    }

    #[tokio::test]
    async fn test_prune_drops_expired_entries() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);
        let now = now_ms();

        let mut log = MessageLog::default();
        log.push(Packet::new("gone", json!(null), "other", None, now - 120_000));
        log.push(Packet::new("kept", json!(null), "other", None, now));
        shared.set_external("intercom", &log.encode().unwrap());
        shared.set_external("intercom_once", &format!(r#"{{"old":{},"new":{}}}"#, now - 7_200_000, now));

        assert_eq!(bus.prune(PruneKind::Log).await, 1);
        assert_eq!(bus.prune(PruneKind::Once).await, 1);
        assert_eq!(bus.prune(PruneKind::Log).await, 0);

        let names: Vec<String> = stored_log(&shared).into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["kept"]);
        let table = OnceTable::parse(shared.snapshot().get("intercom_once").map(String::as_str));
        assert_eq!(table.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_prune_is_throttled() {
        let shared = SharedMemory::new();
        let config = BusConfig {
            prune_throttle_ms: 60_000,
            ..BusConfig::default()
        };
        let bus = Intercom::with_config(KvStore::new(shared.connect()), config, BindingRegistry::new());
        let mut log = MessageLog::default();
        log.push(Packet::new("gone", json!(null), "other", None, now_ms() - 120_000));
        shared.set_external("intercom", &log.encode().unwrap());
        assert_eq!(bus.prune(PruneKind::Log).await, 1);

        shared.set_external("intercom", &log.encode().unwrap());
        assert_eq!(bus.prune(PruneKind::Log).await, 0);
        assert_eq!(stored_log(&shared).len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_removes_all_keys() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);
        bus.emit("a", json!(1)).await;
        bus.once("k", || {}).await;
        shared.set_external("intercom_lock", "1");
        shared.set_external("unrelated", "v");

        Intercom::destroy(bus.store(), bus.config());

        assert_eq!(shared.snapshot().keys().cloned().collect::<Vec<_>>(), vec!["unrelated"]);
    }

    #[tokio::test]
    async fn test_listener_stops_when_bus_dropped() {
        let shared = SharedMemory::new();
        let bus = peer(&shared);
        let weak = bus.downgrade();
        drop(bus);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(weak.upgrade().is_none());
        shared.set_external("intercom", "[]");
    }
}
