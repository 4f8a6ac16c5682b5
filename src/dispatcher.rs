//! Inbound event dispatch (pub/sub).
//!
//! Decodes push-channel frames and fans each [`Envelope`] out to every handler
//! registered for its [`EventType`].
//!
//! # Design Principle: "Subscribe once. React always."
//!
//! Consumers register a callback and keep the returned [`Subscription`] for as
//! long as they are mounted. Dropping the subscription unregisters exactly that
//! callback, so a consumer that goes away can never be invoked afterwards.
//!
//! # Guarantees
//!
//! - Handlers for one type run in registration order.
//! - A handler that returns `Err` or panics is logged; the remaining handlers
//!   still run and the connection is unaffected.
//! - Malformed frames are logged and dropped, never propagated.
//! - Unknown event types are logged and dropped without reaching any handler.
//!
//! # Deadlock Prevention
//!
//! Handlers are collected under the registry lock, then the lock is released
//! before invoking them. A handler may register or unregister other handlers
//! without deadlocking. A handler removed by an earlier handler of the same
//! dispatch is skipped; one added during a dispatch first runs on the next.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::protocol::{Envelope, EventType};

/// Unique identifier for a registered handler.
pub type HandlerId = u64;

/// Callback invoked with `(data, full_envelope)`.
pub type Handler = Arc<dyn Fn(&Value, &Envelope) -> anyhow::Result<()> + Send + Sync>;

/// Storage behind the [`Dispatcher`].
#[derive(Default)]
struct HandlerRegistry {
    /// Map of event type -> ordered list of (id, handler).
    handlers: HashMap<EventType, Vec<(HandlerId, Handler)>>,
    /// Counter for generating unique handler IDs.
    next_id: HandlerId,
}

impl HandlerRegistry {
    fn callback_count(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_count", &self.handlers.len())
            .field("total_handlers", &self.callback_count())
            .field("next_id", &self.next_id)
            .finish()
    }
}

/// Outcome of dispatching one envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

/// Routes decoded envelopes to registered handlers.
///
/// Cheap to clone; clones share one registry.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Mutex<HandlerRegistry>>,
}

impl Dispatcher {
    /// Create a dispatcher with an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`.
    ///
    /// Multiple independent handlers per type are supported; they run in the
    /// order they were registered. The handler stays registered until the
    /// returned [`Subscription`] is dropped or unsubscribed.
    pub fn register<F>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(&Value, &Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock().expect("HandlerRegistry mutex poisoned");
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .handlers
            .entry(event_type.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        drop(registry);

        log::debug!("[Dispatch] Registered handler {} for '{}'", id, event_type);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            event_type,
            id,
            active: true,
        }
    }

    /// Remove one handler. Other handlers for the same type are untouched.
    ///
    /// Returns `false` if the handler was not registered (already removed).
    pub fn unregister(&self, event_type: &EventType, id: HandlerId) -> bool {
        remove_handler(&self.registry, event_type, id)
    }

    /// Number of handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: &EventType) -> usize {
        self.registry
            .lock()
            .expect("HandlerRegistry mutex poisoned")
            .handlers
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Drop every registration.
    ///
    /// Outstanding [`Subscription`]s become no-ops.
    pub fn clear(&self) {
        let mut registry = self.registry.lock().expect("HandlerRegistry mutex poisoned");
        let count = registry.callback_count();
        registry.handlers.clear();
        drop(registry);
        log::debug!("[Dispatch] Cleared {} handlers", count);
    }

    /// Decode a text frame and dispatch it.
    ///
    /// Returns the decoded envelope, or `None` if the frame was malformed
    /// (logged and dropped).
    pub fn dispatch_text(&self, text: &str) -> Option<Envelope> {
        match Envelope::decode(text) {
            Ok(envelope) => {
                self.dispatch(&envelope);
                Some(envelope)
            }
            Err(e) => {
                log::warn!(
                    "[Dispatch] Dropping malformed frame ({}): {}",
                    e,
                    preview(text)
                );
                None
            }
        }
    }

    /// Invoke every handler registered for the envelope's type.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        if !envelope.event_type.is_known() {
            log::debug!(
                "[Dispatch] Ignoring unknown event type '{}'",
                envelope.event_type
            );
            return DispatchReport::default();
        }

        let handlers: Vec<(HandlerId, Handler)> = self
            .registry
            .lock()
            .expect("HandlerRegistry mutex poisoned")
            .handlers
            .get(&envelope.event_type)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            log::trace!("[Dispatch] No handlers for '{}'", envelope.event_type);
            return DispatchReport::default();
        }

        let mut report = DispatchReport::default();
        for (id, handler) in handlers {
            if !is_registered(&self.registry, &envelope.event_type, id) {
                log::trace!("[Dispatch] Handler {} unregistered mid-dispatch, skipping", id);
                continue;
            }
            let result = catch_unwind(AssertUnwindSafe(|| handler(&envelope.data, envelope)));
            match result {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    log::error!(
                        "[Dispatch] Handler {} for '{}' failed: {:#}",
                        id,
                        envelope.event_type,
                        e
                    );
                }
                Err(panic_info) => {
                    report.failed += 1;
                    let msg = panic_info
                        .downcast_ref::<String>()
                        .map(String::as_str)
                        .or_else(|| panic_info.downcast_ref::<&str>().copied())
                        .unwrap_or("unknown panic");
                    log::error!(
                        "[Dispatch] Handler {} for '{}' panicked: {}",
                        id,
                        envelope.event_type,
                        msg
                    );
                }
            }
        }
        report
    }
}

/// First 100 characters of a frame, for log lines.
fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}

fn is_registered(registry: &Mutex<HandlerRegistry>, event_type: &EventType, id: HandlerId) -> bool {
    registry
        .lock()
        .expect("HandlerRegistry mutex poisoned")
        .handlers
        .get(event_type)
        .is_some_and(|list| list.iter().any(|(hid, _)| *hid == id))
}

fn remove_handler(registry: &Mutex<HandlerRegistry>, event_type: &EventType, id: HandlerId) -> bool {
    let mut registry = registry.lock().expect("HandlerRegistry mutex poisoned");
    let Some(list) = registry.handlers.get_mut(event_type) else {
        return false;
    };
    let Some(idx) = list.iter().position(|(hid, _)| *hid == id) else {
        return false;
    };
    list.remove(idx);
    if list.is_empty() {
        registry.handlers.remove(event_type);
    }
    drop(registry);
    log::debug!("[Dispatch] Unregistered handler {} for '{}'", id, event_type);
    true
}

/// Handle returned by [`Dispatcher::register`].
///
/// Unregisters its handler when dropped.
#[must_use = "dropping a Subscription unregisters the handler immediately"]
pub struct Subscription {
    registry: Weak<Mutex<HandlerRegistry>>,
    event_type: EventType,
    id: HandlerId,
    active: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// The handler's id.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// The event type the handler listens to.
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// Unregister now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the handler registered for the dispatcher's whole lifetime.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            remove_handler(&registry, &self.event_type, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
