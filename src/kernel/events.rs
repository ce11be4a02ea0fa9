//! Kernel event fan-out (§3, §4.6).
//!
//! Event delivery is synchronous: handlers run on the emitting thread under
//! no lock, so they must not block. The handler list lives behind its own
//! read/write lock, separate from every other subsystem (§5).

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ProcessId, RequestId, SessionId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelEventType {
    ProcessCreated,
    ProcessStateChanged,
    InterruptRaised,
    ResourceExhausted,
    ServiceRegistered,
    ServiceUnregistered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelEvent {
    pub event_type: KernelEventType,
    pub timestamp: DateTime<Utc>,
    pub request_id: RequestId,
    pub user_id: UserId,
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<ProcessId>,
    pub data: Value,
}

pub type EventHandler = Arc<dyn Fn(&KernelEvent) + Send + Sync>;

/// Synchronous pub/sub fan-out for `KernelEvent`s emitted by the Kernel facade.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: EventHandler) {
        self.handlers.write().expect("event handler lock poisoned").push(handler);
    }

    /// Invoke every handler with `event`, holding no lock while a handler runs.
    pub fn emit(&self, event: &KernelEvent) {
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .expect("event handler lock poisoned")
            .clone();
        for handler in &handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().expect("event handler lock poisoned").len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handler_count", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event() -> KernelEvent {
        KernelEvent {
            event_type: KernelEventType::ProcessCreated,
            timestamp: Utc::now(),
            request_id: RequestId::must("r1"),
            user_id: UserId::must("u1"),
            session_id: SessionId::must("s1"),
            pid: None,
            data: serde_json::json!({}),
        }
    }

    #[test]
    fn emit_invokes_all_registered_handlers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let c2 = count.clone();
        bus.register(Arc::new(move |_: &KernelEvent| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        bus.register(Arc::new(move |_: &KernelEvent| {
            c2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(&event());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_handlers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(&event());
        assert_eq!(bus.handler_count(), 0);
    }
}
