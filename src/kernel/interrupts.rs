//! Flow interrupt management (C5).
//!
//! Owns the interrupt store + indexes exclusively (§3). Built from scratch
//! against the usage contract exercised by `ipc/handlers/interrupt.rs`.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::envelope::{FlowInterrupt, InterruptKind, InterruptResponse};

/// Per-kind defaults (§4.4): whether a response is required, and the TTL
/// applied when the caller doesn't supply an explicit override.
fn kind_defaults(kind: InterruptKind) -> (bool, Option<Duration>) {
    match kind {
        InterruptKind::Clarification => (true, Some(Duration::hours(24))),
        InterruptKind::Confirmation => (true, Some(Duration::hours(1))),
        InterruptKind::AgentReview => (true, Some(Duration::minutes(30))),
        InterruptKind::ResourceExhausted => (false, Some(Duration::minutes(5))),
        InterruptKind::Timeout => (false, Some(Duration::minutes(5))),
        InterruptKind::SystemError => (false, Some(Duration::hours(1))),
        InterruptKind::Checkpoint => (false, None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptStatus {
    Pending,
    Resolved,
    Cancelled,
    Expired,
}

#[derive(Debug, Clone)]
pub struct StoredInterrupt {
    pub interrupt: FlowInterrupt,
    pub status: InterruptStatus,
    pub request_id: String,
    pub user_id: String,
    pub session_id: String,
    pub envelope_id: String,
    pub requires_response: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub struct CreateInterruptParams {
    pub kind: InterruptKind,
    pub request_id: String,
    pub user_id: String,
    pub session_id: String,
    pub envelope_id: String,
    pub question: Option<String>,
    pub message: Option<String>,
    pub data: Option<HashMap<String, serde_json::Value>>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
}

/// Explicit TTL override; `Some(Duration::zero())` is a documented no-op
/// (does not clear `expires_at`), matching observed behavior.
pub struct InterruptOptions {
    pub ttl: Option<Duration>,
}

impl Default for InterruptOptions {
    fn default() -> Self {
        Self { ttl: None }
    }
}

/// Interrupt service - owned by Kernel, called via &mut self.
#[derive(Debug, Default)]
pub struct InterruptService {
    store: HashMap<String, StoredInterrupt>,
    by_request: HashMap<String, Vec<String>>,
    by_session: HashMap<String, Vec<String>>,
}

impl InterruptService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_interrupt(&mut self, params: CreateInterruptParams) -> FlowInterrupt {
        self.create_interrupt_with_options(params, InterruptOptions::default())
    }

    pub fn create_interrupt_with_options(
        &mut self,
        params: CreateInterruptParams,
        options: InterruptOptions,
    ) -> FlowInterrupt {
        let (requires_response, default_ttl) = kind_defaults(params.kind);
        let mut interrupt = FlowInterrupt::new(params.kind);

        if let Some(question) = params.question {
            interrupt = interrupt.with_question(question);
        }
        if let Some(message) = params.message {
            interrupt = interrupt.with_message(message);
        }
        if let Some(data) = params.data {
            interrupt = interrupt.with_data(data);
        }

        let ttl = match options.ttl {
            Some(ttl) if ttl == Duration::zero() => default_ttl,
            Some(ttl) => Some(ttl),
            None => default_ttl,
        };
        if let Some(ttl) = ttl {
            interrupt.expires_at = Some(Utc::now() + ttl);
        }

        let id = interrupt.id.clone();
        self.by_request
            .entry(params.request_id.clone())
            .or_default()
            .push(id.clone());
        self.by_session
            .entry(params.session_id.clone())
            .or_default()
            .push(id.clone());

        self.store.insert(
            id,
            StoredInterrupt {
                interrupt: interrupt.clone(),
                status: InterruptStatus::Pending,
                request_id: params.request_id,
                user_id: params.user_id,
                session_id: params.session_id,
                envelope_id: params.envelope_id,
                requires_response,
                resolved_at: None,
            },
        );

        let _ = (params.trace_id, params.span_id);
        interrupt
    }

    /// Succeeds only if status == PENDING and requester matches owner (when
    /// non-empty). Returns `false` on any other state and logs a warning.
    pub fn resolve(
        &mut self,
        id: &str,
        response: InterruptResponse,
        requester_user_id: Option<&str>,
    ) -> bool {
        let Some(stored) = self.store.get_mut(id) else {
            tracing::warn!(interrupt_id = %id, "resolve_unknown_interrupt");
            return false;
        };
        if stored.status != InterruptStatus::Pending {
            tracing::warn!(interrupt_id = %id, status = ?stored.status, "resolve_non_pending_interrupt");
            return false;
        }
        if let Some(requester) = requester_user_id {
            if !requester.is_empty() && requester != stored.user_id {
                tracing::warn!(interrupt_id = %id, requester = %requester, owner = %stored.user_id, "resolve_ownership_violation");
                return false;
            }
        }

        let mut response = response;
        response.received_at = Utc::now();
        stored.interrupt.response = Some(response);
        stored.status = InterruptStatus::Resolved;
        stored.resolved_at = Some(Utc::now());
        true
    }

    pub fn cancel(&mut self, id: &str, reason: String) -> bool {
        let Some(stored) = self.store.get_mut(id) else {
            return false;
        };
        if stored.status != InterruptStatus::Pending {
            return false;
        }
        stored
            .interrupt
            .data
            .get_or_insert_with(HashMap::new)
            .insert("cancel_reason".to_string(), serde_json::Value::String(reason));
        stored.status = InterruptStatus::Cancelled;
        stored.resolved_at = Some(Utc::now());
        true
    }

    /// Sweep PENDING interrupts past their `expires_at`. Returns the count flipped.
    pub fn expire_pending(&mut self) -> usize {
        let now = Utc::now();
        let mut count = 0;
        for stored in self.store.values_mut() {
            if stored.status == InterruptStatus::Pending {
                if let Some(expires_at) = stored.interrupt.expires_at {
                    if expires_at < now {
                        stored.status = InterruptStatus::Expired;
                        stored.resolved_at = Some(now);
                        count += 1;
                    }
                }
            }
        }
        count
    }

    pub fn get_interrupt(&self, id: &str) -> Option<&FlowInterrupt> {
        self.store.get(id).map(|s| &s.interrupt)
    }

    /// Most-recent non-expired PENDING interrupt for a request.
    pub fn get_pending_for_request(&self, request_id: &str) -> Option<&FlowInterrupt> {
        self.by_request
            .get(request_id)?
            .iter()
            .filter_map(|id| self.store.get(id))
            .filter(|s| s.status == InterruptStatus::Pending)
            .max_by_key(|s| s.interrupt.created_at)
            .map(|s| &s.interrupt)
    }

    pub fn get_pending_for_session(
        &self,
        session_id: &str,
        kinds: Option<&[InterruptKind]>,
    ) -> Vec<FlowInterrupt> {
        self.by_session
            .get(session_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.store.get(id))
            .filter(|s| s.status == InterruptStatus::Pending)
            .filter(|s| kinds.map(|ks| ks.contains(&s.interrupt.kind)).unwrap_or(true))
            .map(|s| s.interrupt.clone())
            .collect()
    }

    /// Remove non-pending interrupts older than `older_than`.
    pub fn cleanup_resolved(&mut self, older_than: chrono::Duration) -> usize {
        let cutoff = Utc::now() - older_than;
        let stale: Vec<String> = self
            .store
            .iter()
            .filter(|(_, s)| s.status != InterruptStatus::Pending)
            .filter(|(_, s)| s.resolved_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        let count = stale.len();
        for id in stale {
            self.remove(&id);
        }
        count
    }

    fn remove(&mut self, id: &str) {
        if let Some(stored) = self.store.remove(id) {
            if let Some(ids) = self.by_request.get_mut(&stored.request_id) {
                ids.retain(|i| i != id);
            }
            if let Some(ids) = self.by_session.get_mut(&stored.session_id) {
                ids.retain(|i| i != id);
            }
        }
    }
}
