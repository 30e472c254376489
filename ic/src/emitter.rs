//! EventEmitter - in-memory named handler registry
//!
//! Handlers are registered per event name and fired synchronously. A second
//! "registration" channel tells interested parties whenever a handler is
//! added, which lets bindings attach to names registered after they were
//! created.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::debug;

/// Event handler receiving the event payload
pub type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Called with the event name each time a handler is registered
pub(crate) type RegistrationHandler = Arc<dyn Fn(&str) + Send + Sync>;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Token returned on registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered list of callbacks addressable by [`HandlerId`]
pub(crate) struct Listeners<F: ?Sized> {
    entries: Mutex<Vec<(HandlerId, Arc<F>)>>,
}

impl<F: ?Sized> Listeners<F> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(HandlerId, Arc<F>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, f: Arc<F>) -> HandlerId {
        let id = HandlerId::next();
        self.entries().push((id, f));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Copy of the callbacks, so they can run without the lock held
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries().iter().map(|(_, f)| f.clone()).collect()
    }
}

/// Named handler registry with register/unregister/fire
pub struct EventEmitter {
    handlers: Mutex<HashMap<String, Vec<(HandlerId, Handler)>>>,
    registrations: Listeners<dyn Fn(&str) + Send + Sync>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            registrations: Listeners::new(),
        }
    }

    fn handlers(&self) -> MutexGuard<'_, HashMap<String, Vec<(HandlerId, Handler)>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler for `name`
    ///
    /// Registration watchers are told about the new handler after it is in
    /// place.
    pub fn on(&self, name: &str, handler: impl Fn(&Value) + Send + Sync + 'static) -> HandlerId {
        let id = HandlerId::next();
        self.handlers()
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(%name, ?id, "EventEmitter::on: handler registered");

        for watcher in self.registrations.snapshot() {
            watcher(name);
        }
        id
    }

    /// Unregister a handler; returns whether it was found
    pub fn off(&self, name: &str, id: HandlerId) -> bool {
        let mut handlers = self.handlers();
        let Some(list) = handlers.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(name);
        }
        debug!(%name, ?id, removed, "EventEmitter::off");
        removed
    }

    /// Fire every handler registered for `name`, in registration order
    ///
    /// Returns the number of handlers invoked. Handlers run without any
    /// internal lock held and may register or unregister handlers.
    pub fn trigger(&self, name: &str, payload: &Value) -> usize {
        let handlers: Vec<Handler> = self
            .handlers()
            .get(name)
            .map(|list| list.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }

    /// Watch handler registrations
    pub fn on_register(&self, watcher: impl Fn(&str) + Send + Sync + 'static) -> HandlerId {
        let watcher: RegistrationHandler = Arc::new(watcher);
        self.registrations.add(watcher)
    }

    /// Stop watching handler registrations
    pub fn off_register(&self, id: HandlerId) -> bool {
        self.registrations.remove(id)
    }

    /// Names that currently have at least one handler
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of handlers registered for `name`
    pub fn handler_count(&self, name: &str) -> usize {
        self.handlers().get(name).map(Vec::len).unwrap_or(0)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
