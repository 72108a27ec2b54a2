//! Typed polling and per-event-type handler dispatch on top of the bridge.

use crate::bridge::Bridge;
use crate::engine::Engine;
use crate::managed::ManagedRuntime;
use crate::model::{Event, EventType};
use crate::runtime::ModelRuntime;

type Handler<C> = Box<dyn FnMut(&mut C, &Event) -> anyhow::Result<()> + Send>;

/// Service `host` once and convert the result into an [`Event`].
pub fn poll_event<E: Engine>(
    bridge: &mut Bridge<E, ModelRuntime>,
    host: i64,
    timeout_millis: i32,
) -> Option<Event> {
    let value = bridge.service(host, timeout_millis)?;
    let event = value.clone().into_event();
    bridge.runtime_mut().delete_local_ref(value);
    event
}

/// Handlers keyed by event type, invoked in registration order.
pub struct EventDispatcher<C> {
    handlers: Vec<(EventType, Handler<C>)>,
}

impl<C> EventDispatcher<C> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn on<F>(&mut self, kind: EventType, handler: F) -> &mut Self
    where
        F: FnMut(&mut C, &Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers.push((kind, Box::new(handler)));
        self
    }

    /// Run every handler registered for the event's type. A failing handler is logged and the
    /// rest still run. Returns how many handlers were invoked.
    pub fn dispatch(&mut self, ctx: &mut C, event: &Event) -> usize {
        let kind = event.event_type();
        let mut invoked = 0;
        for (_, handler) in self.handlers.iter_mut().filter(|(k, _)| *k == kind) {
            invoked += 1;
            if let Err(e) = handler(&mut *ctx, event) {
                tracing::error!(?kind, "event handler failed: {:#}", e);
            }
        }
        invoked
    }

    pub fn handler_count(&self, kind: EventType) -> usize {
        self.handlers.iter().filter(|(k, _)| *k == kind).count()
    }
}

impl<C> Default for EventDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}
