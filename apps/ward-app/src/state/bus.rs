//! # Event Bus
//!
//! Process-wide typed publish/subscribe for cross-cutting notifications.
//!
//! ```text
//!   Store ──StateChanged──┐
//!   Orchestrator ─────────┼──► EventBus::emit ──► handlers registered for that kind
//!   SyncService emitter ──┘                       (each under catch_unwind)
//! ```
//!
//! Handlers run synchronously on the emitting thread. A panicking handler is
//! logged and skipped; the others still run.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::{error, trace};

use ward_core::{Collection, MutationOp, SyncState};

use super::store::StateKey;

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    /// Fatal failures, such as a rejected save.
    Error,
}

/// A short user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

impl Toast {
    pub fn error(message: impl Into<String>) -> Self {
        Toast {
            level: ToastLevel::Error,
            message: message.into(),
        }
    }
}

/// Every event the application publishes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AppEvent {
    Toast(Toast),
    RouteChanged {
        route: String,
    },
    SyncStateChanged {
        state: SyncState,
    },
    /// One top-level store key changed.
    StateChanged {
        key: StateKey,
    },
    /// A record was changed locally (optimistic apply).
    RecordChanged {
        collection: Collection,
        id: String,
        operation: MutationOp,
    },
    /// An optimistic change was undone.
    MutationRolledBack {
        collection: Collection,
        id: String,
        mutation_id: String,
        error: String,
    },
    ConnectivityChanged {
        online: bool,
    },
}

/// Subscription key: one per [`AppEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Toast,
    RouteChanged,
    SyncStateChanged,
    StateChanged,
    RecordChanged,
    MutationRolledBack,
    ConnectivityChanged,
}

impl AppEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AppEvent::Toast(_) => EventKind::Toast,
            AppEvent::RouteChanged { .. } => EventKind::RouteChanged,
            AppEvent::SyncStateChanged { .. } => EventKind::SyncStateChanged,
            AppEvent::StateChanged { .. } => EventKind::StateChanged,
            AppEvent::RecordChanged { .. } => EventKind::RecordChanged,
            AppEvent::MutationRolledBack { .. } => EventKind::MutationRolledBack,
            AppEvent::ConnectivityChanged { .. } => EventKind::ConnectivityChanged,
        }
    }
}

// =============================================================================
// Event Bus
// =============================================================================

type Handler = Arc<dyn Fn(&AppEvent) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not registered.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(h, _)| *h == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Delivers an event to every handler registered for its kind.
    pub fn emit(&self, event: AppEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(?kind, handlers = handlers.len(), "Emitting event");

        for handler in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(?kind, "Event handler panicked");
            }
        }
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handlers_receive_only_their_kind() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        bus.on(EventKind::Toast, move |e| sink.lock().unwrap().push(e.clone()));

        bus.emit(AppEvent::Toast(Toast::error("Save failed")));
        bus.emit(AppEvent::ConnectivityChanged { online: true });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], AppEvent::Toast(Toast::error("Save failed")));
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        bus.on(EventKind::RouteChanged, |_| panic!("boom"));
        let c = count.clone();
        bus.on(EventKind::RouteChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(AppEvent::RouteChanged {
            route: "/patients".to_string(),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_unregisters() {
        let bus = EventBus::new();
        let id = bus.on(EventKind::Toast, |_| {});
        assert_eq!(bus.handler_count(EventKind::Toast), 1);

        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.handler_count(EventKind::Toast), 0);
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let json = serde_json::to_value(AppEvent::ConnectivityChanged { online: false }).unwrap();
        assert_eq!(json["kind"], "connectivity_changed");
        assert_eq!(json["online"], false);
    }

    #[test]
    fn test_toast_serializes_level_and_message() {
        let json = serde_json::to_value(AppEvent::Toast(Toast::error("Save failed: rules"))).unwrap();
        assert_eq!(json["kind"], "toast");
        assert_eq!(json["level"], "error");
        assert_eq!(json["message"], "Save failed: rules");
    }
}
