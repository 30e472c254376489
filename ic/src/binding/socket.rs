//! Socket binding - mirrors the bus onto a socket.io-style connection
//!
//! - Receive: every event name with a handler on the bus, including names
//!   registered later, is watched on the socket; inbound events are relayed
//!   onto the bus without being echoed back.
//! - Send: events this peer emits are forwarded with `socket.emit`.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{BindOptions, BindTarget, Binding, BindingFactory};
use crate::bus::Intercom;
use crate::emitter::{Handler, HandlerId};

/// Minimal socket.io-like surface: named events in both directions
pub trait Socket: Send + Sync {
    /// Call `handler` for every inbound event named `name`
    fn on(&self, name: &str, handler: Handler);

    /// Send an event to the remote end
    fn emit(&self, name: &str, payload: &Value);
}

/// Marks a socket as a bind target
pub struct SocketTarget {
    socket: Arc<dyn Socket>,
}

impl SocketTarget {
    pub fn new(socket: Arc<dyn Socket>) -> Self {
        Self { socket }
    }

    /// Wrap `socket` ready to pass to `Intercom::bind`
    pub fn target(socket: Arc<dyn Socket>) -> BindTarget {
        Arc::new(Self::new(socket))
    }
}

/// Attaches [`SocketTarget`]s
pub struct SocketBindingFactory;

impl BindingFactory for SocketBindingFactory {
    fn kind(&self) -> &'static str {
        "socket"
    }

    fn applies_to(&self, target: &BindTarget) -> bool {
        target.downcast_ref::<SocketTarget>().is_some()
    }

    fn create(&self, target: &BindTarget, options: &BindOptions, bus: &Intercom) -> Option<Binding> {
        let socket = target.downcast_ref::<SocketTarget>()?.socket.clone();
        debug!(?options, "SocketBindingFactory::create: called");

        let mut binding = Binding::new(self.kind());

        if options.receive.is_enabled() {
            match Handle::try_current() {
                Ok(handle) => {
                    let id = watch_inbound(&binding, socket.clone(), options, bus, handle);
                    binding = binding.with_relay_in(id);
                }
                Err(_) => warn!("SocketBindingFactory::create: no tokio runtime, inbound relay disabled"),
            }
        }

        if options.send.is_enabled() {
            let active = binding.active_flag();
            let send = options.send.clone();
            let id = bus.on_emitted(move |name, payload| {
                if active.load(Ordering::Acquire) && send.allows(name, payload) {
                    socket.emit(name, payload);
                }
            });
            binding = binding.with_relay_out(id);
        }

        Some(binding)
    }
}

/// Watch every current and future handler name on the socket
///
/// Returns the registration watcher's id.
fn watch_inbound(
    binding: &Binding,
    socket: Arc<dyn Socket>,
    options: &BindOptions,
    bus: &Intercom,
    handle: Handle,
) -> HandlerId {
    let watched: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
    let active = binding.active_flag();
    let options = options.clone();
    let weak = bus.downgrade();

    let watch = Arc::new(move |name: &str| {
        let first = watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        if !first {
            return;
        }
        debug!(%name, "SocketBinding: watching event");

        let event = name.to_string();
        let active = active.clone();
        let options = options.clone();
        let weak = weak.clone();
        let handle = handle.clone();
        socket.on(
            name,
            Arc::new(move |payload: &Value| {
                if !active.load(Ordering::Acquire) || !options.receive.allows(&event, payload) {
                    return;
                }
                let id = options.id_for(&event, payload);
                let event = event.clone();
                let payload = payload.clone();
                let weak = weak.clone();
                handle.spawn(async move {
                    if let Some(bus) = weak.upgrade() {
                        bus.relay(&event, payload, id.as_deref()).await;
                    }
                });
            }),
        );
    });

    // Watcher first, so a name registered during the scan below is not missed
    let watcher = watch.clone();
    let id = bus.on_handler_registered(move |name| watcher(name));
    for name in bus.handler_names() {
        watch(name.as_str());
    }
    id
}
