//! Communication bus for pub/sub and request/response patterns — the
//! CommBusService companion (§6): `Publish`/`Send`/`Query`/`Subscribe`.
//!
//! Each subscriber owns a bounded channel (buffer 100, §4.7). Publish never
//! blocks: a full subscriber channel drops the event for that subscriber
//! and logs a warning rather than backing up the publisher.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::types::Result;

/// Per-subscriber channel buffer (§4.7: "buffer 100").
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub timestamp_ms: i64,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub command_type: String,
    pub payload: Vec<u8>,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub query_type: String,
    pub payload: Vec<u8>,
    pub timeout_ms: u64,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub success: bool,
    pub result: Vec<u8>,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub event_types: Vec<String>,
}

struct SubscriberHandle {
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct CommBusInner {
    subscribers: HashMap<String, SubscriberHandle>,
    by_event_type: HashMap<String, HashSet<String>>,
}

/// Pub/sub + request/response bus. One lock, never held across an await
/// (sends are non-blocking `try_send`), matching the per-subsystem
/// lock-discipline of the rest of the kernel (§5).
#[derive(Debug)]
pub struct CommBus {
    inner: Mutex<CommBusInner>,
}

impl CommBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CommBusInner::default()),
        }
    }

    /// Deliver `event` to every subscriber registered for its event type.
    /// Returns the number of subscribers it was actually delivered to.
    pub async fn publish(&self, event: Event) -> Result<usize> {
        let mut delivered = 0;
        let mut stale = Vec::new();
        {
            let inner = self.inner.lock().expect("commbus lock poisoned");
            if let Some(subs) = inner.by_event_type.get(&event.event_type) {
                for sub_id in subs {
                    let Some(handle) = inner.subscribers.get(sub_id) else {
                        continue;
                    };
                    match handle.tx.try_send(event.clone()) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            tracing::warn!(subscriber_id = %sub_id, event_type = %event.event_type, "subscriber_channel_full");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            stale.push(sub_id.clone());
                        }
                    }
                }
            }
        }
        if !stale.is_empty() {
            let mut inner = self.inner.lock().expect("commbus lock poisoned");
            for sub_id in stale {
                remove_subscriber(&mut inner, &sub_id);
            }
        }
        Ok(delivered)
    }

    /// Fire-and-forget command dispatch. No in-core handler registry exists
    /// (commands are fielded by external workers, out of scope per §1); this
    /// records the dispatch and succeeds unconditionally.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        tracing::debug!(command_type = %command.command_type, source = %command.source, "command dispatched");
        Ok(())
    }

    /// Request/response query. No in-core query handler registry exists;
    /// returns a deterministic "no handler" response rather than hanging
    /// until `timeout_ms` elapses.
    pub async fn query(&self, query: Query) -> Result<QueryResponse> {
        Ok(QueryResponse {
            success: false,
            result: Vec::new(),
            error: format!("no handler registered for query type: {}", query.query_type),
        })
    }

    /// Register a new subscriber for the given event types. Returns the
    /// subscription handle and the receiving end of its bounded channel.
    pub async fn subscribe(
        &self,
        sub_id: String,
        event_types: Vec<String>,
    ) -> Result<(Subscription, mpsc::Receiver<Event>)> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().expect("commbus lock poisoned");
        inner.subscribers.insert(sub_id.clone(), SubscriberHandle { tx });
        for event_type in &event_types {
            inner
                .by_event_type
                .entry(event_type.clone())
                .or_default()
                .insert(sub_id.clone());
        }
        Ok((
            Subscription {
                id: sub_id,
                event_types,
            },
            rx,
        ))
    }

    /// Remove a subscriber from every event-type index. Called on
    /// disconnect (§4.7: "cleanup on disconnect removes the subscriber from
    /// all type indexes").
    pub fn unsubscribe(&self, sub_id: &str) {
        let mut inner = self.inner.lock().expect("commbus lock poisoned");
        remove_subscriber(&mut inner, sub_id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("commbus lock poisoned").subscribers.len()
    }
}

fn remove_subscriber(inner: &mut CommBusInner, sub_id: &str) {
    inner.subscribers.remove(sub_id);
    for subs in inner.by_event_type.values_mut() {
        subs.remove(sub_id);
    }
    inner.by_event_type.retain(|_, subs| !subs.is_empty());
}

impl Default for CommBus {
    fn default() -> Self {
        Self::new()
    }
}
