//! TCP IPC server — accept loop and per-connection handler.
//!
//! Each connection is routed directly against a shared `Arc<Kernel>`; there is
//! no single-actor dispatch task. Every subsystem the kernel composes locks
//! itself (§5), so two connections calling unrelated processes run fully
//! concurrently instead of queueing behind one owner task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::ipc::codec::{
    read_frame, write_frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE, MSG_STREAM_CHUNK, MSG_STREAM_END,
};
use crate::ipc::router::{self, DispatchResponse, RequestMeta};
use crate::kernel::Kernel;
use crate::types::{Error, IpcConfig, Result};

fn required_str_field<'a>(
    request: &'a serde_json::Value,
    key: &str,
) -> std::result::Result<&'a str, String> {
    request
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("Missing required request field: {}", key))
}

struct ParsedRequest {
    request_id: String,
    service: String,
    method: String,
    body: serde_json::Value,
    meta: RequestMeta,
}

struct RequestValidationError {
    request_id: String,
    message: String,
}

fn parse_request(request: &serde_json::Value) -> std::result::Result<ParsedRequest, RequestValidationError> {
    let request_id_hint = request
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let request_id = required_str_field(request, "id")
        .map(str::to_string)
        .map_err(|message| RequestValidationError {
            request_id: request_id_hint.clone(),
            message,
        })?;

    let service = required_str_field(request, "service")
        .map(str::to_string)
        .map_err(|message| RequestValidationError {
            request_id: request_id.clone(),
            message,
        })?;

    let method = required_str_field(request, "method")
        .map(str::to_string)
        .map_err(|message| RequestValidationError {
            request_id: request_id.clone(),
            message,
        })?;

    let body = request
        .get("body")
        .cloned()
        .ok_or_else(|| RequestValidationError {
            request_id: request_id.clone(),
            message: "Missing required request field: body".to_string(),
        })?;

    let meta = RequestMeta::parse(request.get("meta"));

    Ok(ParsedRequest {
        request_id,
        service,
        method,
        body,
        meta,
    })
}

/// Encode a JSON value to msgpack. Logs and returns an error on failure
/// instead of silently producing an empty vec.
fn encode_msgpack(value: &serde_json::Value) -> std::io::Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(|e| {
        tracing::error!("Msgpack encoding failed: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
    })
}

async fn send_error_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &serde_json::Value,
    timeout: Duration,
) -> std::io::Result<()> {
    let encoded = encode_msgpack(response)?;
    timed_write(writer, MSG_ERROR, &encoded, timeout).await
}

async fn send_error<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: &str,
    code: &str,
    message: impl Into<String>,
    timeout: Duration,
) -> std::io::Result<()> {
    let response = serde_json::json!({
        "id": request_id,
        "ok": false,
        "error": {
            "code": code,
            "message": message.into(),
        }
    });
    send_error_response(writer, &response, timeout).await
}

/// IPC server wrapping the kernel.
#[derive(Debug)]
pub struct IpcServer {
    kernel: Arc<Kernel>,
    addr: SocketAddr,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
}

impl IpcServer {
    pub fn new(kernel: Kernel, addr: SocketAddr, ipc_config: IpcConfig) -> Self {
        Self {
            kernel: Arc::new(kernel),
            addr,
            cancel: CancellationToken::new(),
            ipc_config,
        }
    }

    /// Share the kernel with a background service (e.g. `CleanupService`)
    /// started alongside the IPC server.
    pub fn kernel(&self) -> Arc<Kernel> {
        self.kernel.clone()
    }

    /// Run the server until cancelled or a fatal error occurs.
    pub async fn serve(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        let conn_semaphore = Arc::new(Semaphore::new(self.ipc_config.max_connections));
        tracing::info!(
            "IPC server listening on {} (max_connections={})",
            self.addr,
            self.ipc_config.max_connections,
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("IPC server shutting down");
                    break;
                }
                accept = listener.accept() => {
                    let (stream, peer) = accept?;

                    // Acquire connection permit (backpressure when at capacity).
                    let permit = match conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            tracing::warn!(
                                "Connection from {} rejected: at max_connections ({})",
                                peer,
                                self.ipc_config.max_connections,
                            );
                            drop(stream);
                            continue;
                        }
                    };

                    tracing::debug!("IPC connection from {} (active={})",
                        peer,
                        self.ipc_config.max_connections - conn_semaphore.available_permits(),
                    );
                    let kernel = self.kernel.clone();
                    let cancel = self.cancel.clone();
                    let ipc_config = self.ipc_config.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, kernel, cancel, ipc_config, permit).await {
                            tracing::warn!("Connection from {} error: {}", peer, e);
                        }
                        // permit is dropped here, releasing the connection slot
                    });
                }
            }
        }
        Ok(())
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Interceptor chain around dispatch: recovery → logging → metrics (§4.7).
///
/// Runs the pre-dispatch deadline and identity checks, then the handler
/// itself, all inside the panic-recovery boundary, and logs/records a
/// completion event carrying `method`, `status_code`/`code`, `duration_ms`
/// regardless of outcome.
async fn dispatch_with_interceptors(
    kernel: &Kernel,
    service: &str,
    method: &str,
    body: serde_json::Value,
    meta: &RequestMeta,
    ipc_config: &IpcConfig,
) -> Result<DispatchResponse> {
    let start = std::time::Instant::now();
    tracing::debug!(service = %service, method = %method, "rpc_start");

    let result = crate::kernel::recovery::with_recovery_async(
        || async move {
            // Deadline check happens before any substantive work (§5/§4.7).
            if meta.deadline_exceeded() {
                return Err(Error::timeout(format!("deadline exceeded before dispatching {service}.{method}")));
            }
            // CreateProcess establishes identity from the body; everything
            // else must carry it on the transport (§4.7).
            if !(service == "kernel" && method == "CreateProcess") {
                meta.require_identity()?;
            }
            router::route_request(kernel, service, method, body, meta, ipc_config).await
        },
        "ipc_route_request",
    )
    .await;

    let duration_ms = start.elapsed().as_millis();
    match &result {
        Ok(_) => {
            tracing::info!(service = %service, method = %method, status_code = "OK", duration_ms, "rpc_complete");
            tracing::debug!(target: "metrics", service = %service, method = %method, code = "OK", latency_ms = duration_ms, "rpc_metrics");
        }
        Err(e) => {
            let code = e.code().to_string();
            tracing::warn!(service = %service, method = %method, status_code = %code, duration_ms, error = %e, "rpc_failed");
            tracing::debug!(target: "metrics", service = %service, method = %method, code = %code, latency_ms = duration_ms, "rpc_metrics");
        }
    }

    result
}

/// Handle a single TCP connection: read frames → dispatch → write responses.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    kernel: Arc<Kernel>,
    cancel: CancellationToken,
    ipc_config: IpcConfig,
    _permit: OwnedSemaphorePermit, // held for connection lifetime
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let read_timeout = Duration::from_secs(ipc_config.read_timeout_secs);
    let write_timeout = Duration::from_secs(ipc_config.write_timeout_secs);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame_result = tokio::time::timeout(read_timeout, read_frame(&mut reader, ipc_config.max_frame_bytes)) => {
                let frame = match frame_result {
                    Err(_elapsed) => {
                        tracing::debug!("Read timeout ({}s), dropping connection", ipc_config.read_timeout_secs);
                        break;
                    }
                    Ok(result) => match result? {
                        Some(f) => f,
                        None => break, // clean EOF
                    },
                };

                let (msg_type, payload_bytes) = frame;

                if msg_type != MSG_REQUEST {
                    send_error(
                        &mut writer,
                        "",
                        "INVALID_ARGUMENT",
                        format!("Unexpected message type: 0x{:02X}", msg_type),
                        write_timeout,
                    )
                    .await?;
                    continue;
                }

                // Decode msgpack request
                let request: serde_json::Value = match rmp_serde::from_slice(&payload_bytes) {
                    Ok(v) => v,
                    Err(e) => {
                        send_error(
                            &mut writer,
                            "",
                            "INVALID_ARGUMENT",
                            format!("Invalid msgpack: {}", e),
                            write_timeout,
                        )
                        .await?;
                        continue;
                    }
                };

                let ParsedRequest {
                    request_id,
                    service,
                    method,
                    body,
                    meta,
                } = match parse_request(&request) {
                    Ok(parsed) => parsed,
                    Err(validation_error) => {
                        send_error(
                            &mut writer,
                            &validation_error.request_id,
                            "INVALID_ARGUMENT",
                            validation_error.message,
                            write_timeout,
                        )
                        .await?;
                        continue;
                    }
                };

                let result = dispatch_with_interceptors(&kernel, &service, &method, body, &meta, &ipc_config).await;

                match result {
                    Ok(DispatchResponse::Single(response_body)) => {
                        let response = serde_json::json!({
                            "id": request_id,
                            "ok": true,
                            "body": response_body,
                        });
                        let encoded = encode_msgpack(&response)?;
                        timed_write(&mut writer, MSG_RESPONSE, &encoded, write_timeout).await?;
                    }
                    Ok(DispatchResponse::Stream(mut rx)) => {
                        // Stream chunks until the sender closes
                        while let Some(chunk) = rx.recv().await {
                            let frame = serde_json::json!({
                                "id": request_id,
                                "body": chunk,
                            });
                            let encoded = encode_msgpack(&frame)?;
                            timed_write(&mut writer, MSG_STREAM_CHUNK, &encoded, write_timeout).await?;
                        }
                        // End-of-stream sentinel
                        let end = serde_json::json!({ "id": request_id });
                        let encoded = encode_msgpack(&end)?;
                        timed_write(&mut writer, MSG_STREAM_END, &encoded, write_timeout).await?;
                    }
                    Err(e) => {
                        send_error(
                            &mut writer,
                            &request_id,
                            &e.code().to_string(),
                            e.to_string(),
                            write_timeout,
                        )
                        .await?;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Write a frame with a timeout. Returns an error if the write takes too long
/// (prevents slow consumers from holding connections indefinitely).
async fn timed_write<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: u8,
    payload: &[u8],
    timeout: Duration,
) -> std::io::Result<()> {
    tokio::time::timeout(timeout, write_frame(writer, msg_type, payload))
        .await
        .map_err(|_| {
            tracing::warn!(
                "Write timeout ({}s), dropping connection",
                timeout.as_secs()
            );
            std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout")
        })?
}
