//! Bindings - relay events between the bus and external transports
//!
//! A [`BindingFactory`] decides whether it can attach to a target object and,
//! if so, wires it to the bus. Factories live in a [`BindingRegistry`] that is
//! handed to the bus at construction; `Intercom::bind` offers a target to every
//! registered factory.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::debug;

use crate::bus::Intercom;
use crate::emitter::HandlerId;

mod socket;

pub use socket::{Socket, SocketBindingFactory, SocketTarget};

/// Any object a factory may know how to attach to
pub type BindTarget = Arc<dyn Any + Send + Sync>;

/// Decides per event whether it is relayed: `(name, payload) -> relay?`
pub type EventFilter = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Derives a deduplication id for an inbound event: `(name, payload) -> id`
pub type IdExtractor = Arc<dyn Fn(&str, &Value) -> Option<String> + Send + Sync>;

/// Whether, and which, events cross a binding in one direction
#[derive(Clone, Default)]
pub enum Relay {
    Off,
    #[default]
    All,
    Filter(EventFilter),
}

impl Relay {
    /// Relay only events accepted by `filter`
    pub fn filter(filter: impl Fn(&str, &Value) -> bool + Send + Sync + 'static) -> Self {
        Self::Filter(Arc::new(filter))
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }

    pub fn allows(&self, name: &str, payload: &Value) -> bool {
        match self {
            Self::Off => false,
            Self::All => true,
            Self::Filter(filter) => filter(name, payload),
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::All => write!(f, "All"),
            Self::Filter(_) => write!(f, "Filter(..)"),
        }
    }
}

/// Options for `Intercom::bind`
///
/// Both directions default to relaying everything, with no id extractor.
#[derive(Clone, Default)]
pub struct BindOptions {
    /// Id for inbound events, so the same event arriving twice is relayed once
    pub id: Option<IdExtractor>,
    /// Bus emits forwarded to the target
    pub send: Relay,
    /// Target events relayed onto the bus
    pub receive: Relay,
}

impl BindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, extractor: impl Fn(&str, &Value) -> Option<String> + Send + Sync + 'static) -> Self {
        self.id = Some(Arc::new(extractor));
        self
    }

    pub fn send(mut self, relay: Relay) -> Self {
        self.send = relay;
        self
    }

    pub fn receive(mut self, relay: Relay) -> Self {
        self.receive = relay;
        self
    }

    /// Inbound id for an event, if an extractor is set and yields one
    pub fn id_for(&self, name: &str, payload: &Value) -> Option<String> {
        self.id.as_ref().and_then(|extractor| extractor(name, payload))
    }
}

impl std::fmt::Debug for BindOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindOptions")
            .field("id", &self.id.is_some())
            .field("send", &self.send)
            .field("receive", &self.receive)
            .finish()
    }
}

/// A live attachment between the bus and a target
///
/// `relay_in` is the bus subscription feeding the inbound side (if any),
/// `relay_out` the one feeding the outbound side. Callbacks the factory hands
/// to the target itself must check [`Binding::active_flag`], since a target
/// cannot always unregister them.
#[derive(Debug)]
pub struct Binding {
    kind: &'static str,
    relay_in: Option<HandlerId>,
    relay_out: Option<HandlerId>,
    active: Arc<AtomicBool>,
}

impl Binding {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            relay_in: None,
            relay_out: None,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Record the registration watcher driving the inbound side
    pub fn with_relay_in(mut self, id: HandlerId) -> Self {
        self.relay_in = Some(id);
        self
    }

    /// Record the emitted listener driving the outbound side
    pub fn with_relay_out(mut self, id: HandlerId) -> Self {
        self.relay_out = Some(id);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn relay_in(&self) -> Option<HandlerId> {
        self.relay_in
    }

    pub fn relay_out(&self) -> Option<HandlerId> {
        self.relay_out
    }

    /// Shared flag, cleared when the binding is detached
    pub fn active_flag(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove this binding's bus subscriptions and silence its target callbacks
    pub(crate) fn detach(&self, bus: &Intercom) {
        debug!(kind = self.kind, "Binding::detach: called");
        self.active.store(false, Ordering::Release);
        if let Some(id) = self.relay_in {
            bus.off_handler_registered(id);
        }
        if let Some(id) = self.relay_out {
            bus.off_emitted(id);
        }
    }
}

/// Attaches one kind of target to the bus
pub trait BindingFactory: Send + Sync {
    /// Short name used in logs
    fn kind(&self) -> &'static str;

    /// Whether this factory knows how to attach to `target`
    fn applies_to(&self, target: &BindTarget) -> bool;

    /// Wire `target` to `bus`; `None` if nothing was attached
    fn create(&self, target: &BindTarget, options: &BindOptions, bus: &Intercom) -> Option<Binding>;
}

/// The binding factories a bus offers targets to, in order
#[derive(Clone, Default)]
pub struct BindingRegistry {
    factories: Vec<Arc<dyn BindingFactory>>,
}

impl BindingRegistry {
    /// Registry with no factories
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in factories
    pub fn with_defaults() -> Self {
        debug!("BindingRegistry::with_defaults: called");
        let mut registry = Self::new();
        registry.register(SocketBindingFactory);
        registry
    }

    /// Add a factory after the existing ones
    pub fn register(&mut self, factory: impl BindingFactory + 'static) {
        debug!(kind = factory.kind(), "BindingRegistry::register: called");
        self.factories.push(Arc::new(factory));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn BindingFactory>> {
        self.factories.iter()
    }

    /// Kinds of every registered factory, in order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.factories.iter().map(|factory| factory.kind()).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingRegistry").field("kinds", &self.kinds()).finish()
    }
}
