//! Top-level IPC router — routes by service, delegates to handlers.

use chrono::{DateTime, Utc};

use crate::ipc::handlers;
use crate::kernel::Kernel;
use crate::types::{Error, IpcConfig, Result};
use serde_json::Value;
use tokio::sync::mpsc;

/// Result from dispatching a request.
#[allow(missing_debug_implementations)]
pub enum DispatchResponse {
    /// Single response value (most endpoints).
    Single(Value),
    /// Streaming response — server writes each value as MSG_STREAM_CHUNK,
    /// then MSG_STREAM_END when the receiver closes.
    Stream(mpsc::Receiver<Value>),
}

/// Caller identity and deadline extracted from transport metadata (§4.7).
///
/// `CreateProcess` is the sole exemption: it takes identity from the request
/// body instead, since it is the call that establishes it.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub request_id: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
}

impl RequestMeta {
    pub fn parse(meta: Option<&Value>) -> Self {
        let non_empty = |v: Option<&Value>| {
            v.and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let Some(meta) = meta else {
            return Self::default();
        };
        let deadline = meta
            .get("deadline_unix_ms")
            .and_then(|v| v.as_i64())
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        Self {
            user_id: non_empty(meta.get("user_id")),
            session_id: non_empty(meta.get("session_id")),
            request_id: non_empty(meta.get("request_id")),
            deadline,
        }
    }

    /// Require `(user_id, session_id, request_id)` to all be present.
    /// UNAUTHENTICATED otherwise (§4.7).
    pub fn require_identity(&self) -> Result<(&str, &str, &str)> {
        match (&self.user_id, &self.session_id, &self.request_id) {
            (Some(u), Some(s), Some(r)) => Ok((u.as_str(), s.as_str(), r.as_str())),
            _ => Err(Error::unauthenticated(
                "missing transport identity metadata (user_id/session_id/request_id)",
            )),
        }
    }

    pub fn deadline_exceeded(&self) -> bool {
        self.deadline.map(|d| d < Utc::now()).unwrap_or(false)
    }
}

/// Route an IPC request to the appropriate service handler.
///
/// Takes `&Kernel`, not `&mut Kernel` - every subsystem locks itself, so
/// concurrent connections can be routed through the same `Arc<Kernel>`
/// without serializing on a shared mutable reference (§5).
pub async fn route_request(
    kernel: &Kernel,
    service: &str,
    method: &str,
    body: Value,
    meta: &RequestMeta,
    ipc_config: &IpcConfig,
) -> Result<DispatchResponse> {
    match service {
        "kernel" => handlers::kernel::handle(kernel, method, body, meta).await,
        "orchestration" => handlers::orchestration::handle(kernel, method, body).await,
        "commbus" => handlers::commbus::handle(kernel, method, body, ipc_config).await,
        "interrupt" => handlers::interrupt::handle(kernel, method, body).await,
        _ => Err(Error::not_found(format!("Unknown service: {}", service))),
    }
}

// =============================================================================
// Shared helpers — used by all handler modules
// =============================================================================

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}
