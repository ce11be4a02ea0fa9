//! IPC integration tests — validates codec→router→kernel→response round-trip.

use jeeves_core::ipc::codec::{
    write_frame, MSG_ERROR, MSG_REQUEST, MSG_RESPONSE, MSG_STREAM_CHUNK,
};
use jeeves_core::ipc::IpcServer;
use jeeves_core::kernel::Kernel;
use jeeves_core::types::IpcConfig;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Helper: spin up an IpcServer on a random port, return (addr, server_task).
async fn start_test_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let kernel = Kernel::new();

    // Bind temporarily to get a free port, then drop immediately
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let handle = tokio::spawn(async move {
        let server = IpcServer::new(kernel, addr, IpcConfig::default());
        let _ = server.serve().await;
    });

    // Give the server a moment to bind
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    (addr, handle)
}

/// Helper: send a request frame, receive and decode the response. Carries a
/// default transport identity (`meta`) so calls to every method but
/// CreateProcess clear the UNAUTHENTICATED gate.
async fn round_trip(
    stream: &mut TcpStream,
    service: &str,
    method: &str,
    body: serde_json::Value,
) -> (u8, serde_json::Value) {
    round_trip_as(stream, service, method, body, "default-user", "default-sess").await
}

/// Like `round_trip`, but with an explicit caller identity — for ownership
/// tests that need to act as a specific user.
async fn round_trip_as(
    stream: &mut TcpStream,
    service: &str,
    method: &str,
    body: serde_json::Value,
    user_id: &str,
    session_id: &str,
) -> (u8, serde_json::Value) {
    let request = serde_json::json!({
        "id": "test-1",
        "service": service,
        "method": method,
        "body": body,
        "meta": {
            "user_id": user_id,
            "session_id": session_id,
            "request_id": "test-req-1",
        },
    });

    let payload = rmp_serde::to_vec_named(&request).unwrap();
    write_frame(stream, MSG_REQUEST, &payload).await.unwrap();

    // Read response frame
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    let mut frame_data = vec![0u8; frame_len];
    stream.read_exact(&mut frame_data).await.unwrap();

    let msg_type = frame_data[0];
    let response: serde_json::Value = rmp_serde::from_slice(&frame_data[1..]).unwrap();
    (msg_type, response)
}

#[tokio::test]
async fn test_create_process_round_trip() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let body = serde_json::json!({
        "pid": "test-proc-1",
        "request_id": "req-1",
        "user_id": "user-1",
        "session_id": "sess-1",
        "priority": "NORMAL",
        "quota": {
            "max_llm_calls": 100,
            "max_tool_calls": 50,
            "max_agent_hops": 10,
            "max_iterations": 20,
            "timeout_seconds": 300,
        },
    });

    let (msg_type, response) = round_trip(&mut stream, "kernel", "CreateProcess", body).await;

    assert_eq!(msg_type, MSG_RESPONSE);
    assert_eq!(response.get("ok").unwrap().as_bool().unwrap(), true);
    let resp_body = response.get("body").unwrap();
    assert_eq!(resp_body.get("pid").unwrap().as_str().unwrap(), "test-proc-1");
    assert_eq!(resp_body.get("state").unwrap().as_str().unwrap(), "NEW");
}

#[tokio::test]
async fn test_unknown_service_returns_error() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (msg_type, response) =
        round_trip(&mut stream, "nonexistent", "Foo", serde_json::json!({})).await;

    assert_eq!(msg_type, MSG_ERROR);
    assert_eq!(response.get("ok").unwrap().as_bool().unwrap(), false);
    let error = response.get("error").unwrap();
    assert_eq!(error.get("code").unwrap().as_str().unwrap(), "NOT_FOUND");
}

#[tokio::test]
async fn test_kernel_shared_state() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Create process
    let body = serde_json::json!({
        "pid": "shared-test",
        "request_id": "req-s",
        "user_id": "default-user",
        "session_id": "sess-s",
        "priority": "NORMAL",
    });
    let (msg_type, _) = round_trip(&mut stream, "kernel", "CreateProcess", body).await;
    assert_eq!(msg_type, MSG_RESPONSE);

    // Get it back
    let (msg_type, response) = round_trip(
        &mut stream,
        "kernel",
        "GetProcess",
        serde_json::json!({"pid": "shared-test"}),
    )
    .await;
    assert_eq!(msg_type, MSG_RESPONSE);
    let resp_body = response.get("body").unwrap();
    assert_eq!(resp_body.get("pid").unwrap().as_str().unwrap(), "shared-test");
}

// =============================================================================
// Authentication / ownership
// =============================================================================

#[tokio::test]
async fn test_missing_transport_identity_is_unauthenticated() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // No `meta` object at all — everything but CreateProcess must reject.
    let request = serde_json::json!({
        "id": "test-1",
        "service": "kernel",
        "method": "GetProcess",
        "body": { "pid": "whatever" },
    });
    let payload = rmp_serde::to_vec_named(&request).unwrap();
    write_frame(&mut stream, MSG_REQUEST, &payload).await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    let mut frame_data = vec![0u8; frame_len];
    stream.read_exact(&mut frame_data).await.unwrap();

    assert_eq!(frame_data[0], MSG_ERROR);
    let response: serde_json::Value = rmp_serde::from_slice(&frame_data[1..]).unwrap();
    let error = response.get("error").unwrap();
    assert_eq!(error.get("code").unwrap().as_str().unwrap(), "UNAUTHENTICATED");
}

#[tokio::test]
async fn test_ownership_violation_is_permission_denied() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    round_trip_as(
        &mut stream,
        "kernel",
        "CreateProcess",
        serde_json::json!({
            "pid": "owned-by-a",
            "request_id": "req-a",
            "user_id": "user-a",
            "session_id": "sess-a",
            "priority": "NORMAL",
        }),
        "user-a",
        "sess-a",
    )
    .await;

    let (msg_type, response) = round_trip_as(
        &mut stream,
        "kernel",
        "GetProcess",
        serde_json::json!({"pid": "owned-by-a"}),
        "user-b",
        "sess-b",
    )
    .await;

    assert_eq!(msg_type, MSG_ERROR);
    let error = response.get("error").unwrap();
    assert_eq!(error.get("code").unwrap().as_str().unwrap(), "PERMISSION_DENIED");
    let message = error.get("message").unwrap().as_str().unwrap();
    assert!(message.contains("user-a"));
    assert!(message.contains("user-b"));
}

// =============================================================================
// Quota pre-flight
// =============================================================================

#[tokio::test]
async fn test_schedule_over_quota_is_resource_exhausted() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    round_trip(
        &mut stream,
        "kernel",
        "CreateProcess",
        serde_json::json!({
            "pid": "over-quota",
            "request_id": "req-q",
            "user_id": "default-user",
            "session_id": "sess-q",
            "priority": "NORMAL",
            "quota": { "max_llm_calls": 1 },
        }),
    )
    .await;

    round_trip(
        &mut stream,
        "kernel",
        "RecordUsage",
        serde_json::json!({"pid": "over-quota", "llm_calls": 2}),
    )
    .await;

    let (msg_type, response) = round_trip(
        &mut stream,
        "kernel",
        "ScheduleProcess",
        serde_json::json!({"pid": "over-quota"}),
    )
    .await;

    assert_eq!(msg_type, MSG_ERROR);
    let error = response.get("error").unwrap();
    assert_eq!(error.get("code").unwrap().as_str().unwrap(), "RESOURCE_EXHAUSTED");

    // Process must not have transitioned out of READY.
    let (_, response) = round_trip(
        &mut stream,
        "kernel",
        "GetProcess",
        serde_json::json!({"pid": "over-quota"}),
    )
    .await;
    assert_eq!(
        response.get("body").unwrap().get("state").unwrap().as_str().unwrap(),
        "READY"
    );
}

// =============================================================================
// Deadline
// =============================================================================

#[tokio::test]
async fn test_expired_deadline_is_deadline_exceeded() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = serde_json::json!({
        "id": "test-1",
        "service": "kernel",
        "method": "GetSystemStatus",
        "body": {},
        "meta": {
            "user_id": "default-user",
            "session_id": "default-sess",
            "request_id": "test-req-1",
            "deadline_unix_ms": 1,
        },
    });
    let payload = rmp_serde::to_vec_named(&request).unwrap();
    write_frame(&mut stream, MSG_REQUEST, &payload).await.unwrap();

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    let mut frame_data = vec![0u8; frame_len];
    stream.read_exact(&mut frame_data).await.unwrap();

    assert_eq!(frame_data[0], MSG_ERROR);
    let response: serde_json::Value = rmp_serde::from_slice(&frame_data[1..]).unwrap();
    let error = response.get("error").unwrap();
    assert_eq!(error.get("code").unwrap().as_str().unwrap(), "DEADLINE_EXCEEDED");
}

// =============================================================================
// GetNextRunnable dispatch semantics
// =============================================================================

#[tokio::test]
async fn test_get_next_runnable_transitions_to_running() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    round_trip(
        &mut stream,
        "kernel",
        "CreateProcess",
        serde_json::json!({
            "pid": "dispatch-me",
            "request_id": "req-d",
            "user_id": "default-user",
            "session_id": "sess-d",
            "priority": "NORMAL",
        }),
    )
    .await;

    let (msg_type, response) =
        round_trip(&mut stream, "kernel", "GetNextRunnable", serde_json::json!({})).await;
    assert_eq!(msg_type, MSG_RESPONSE);
    let body = response.get("body").unwrap();
    assert_eq!(body.get("pid").unwrap().as_str().unwrap(), "dispatch-me");
    assert_eq!(body.get("state").unwrap().as_str().unwrap(), "RUNNING");

    // Not re-dispatchable: the ready queue is now empty.
    let (_, response) =
        round_trip(&mut stream, "kernel", "GetNextRunnable", serde_json::json!({})).await;
    let error = response.get("error");
    assert!(error.is_some());
}

#[tokio::test]
async fn test_concurrent_connections_share_state() {
    let (addr, _handle) = start_test_server().await;

    let mut writer_stream = TcpStream::connect(addr).await.unwrap();
    round_trip(
        &mut writer_stream,
        "kernel",
        "CreateProcess",
        serde_json::json!({
            "pid": "cross-conn",
            "request_id": "req-c",
            "user_id": "default-user",
            "session_id": "sess-c",
            "priority": "NORMAL",
        }),
    )
    .await;

    // A second, independent connection sees the process created by the first.
    let mut reader_stream = TcpStream::connect(addr).await.unwrap();
    let (msg_type, response) = round_trip(
        &mut reader_stream,
        "kernel",
        "GetProcess",
        serde_json::json!({"pid": "cross-conn"}),
    )
    .await;
    assert_eq!(msg_type, MSG_RESPONSE);
    assert_eq!(
        response
            .get("body")
            .unwrap()
            .get("pid")
            .unwrap()
            .as_str()
            .unwrap(),
        "cross-conn"
    );
}

#[tokio::test]
async fn test_get_system_status() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    round_trip(
        &mut stream,
        "kernel",
        "CreateProcess",
        serde_json::json!({
            "pid": "status-proc",
            "request_id": "req-st",
            "user_id": "user-st",
            "session_id": "sess-st",
            "priority": "NORMAL",
        }),
    )
    .await;

    let (msg_type, response) =
        round_trip(&mut stream, "kernel", "GetSystemStatus", serde_json::json!({})).await;
    assert_eq!(msg_type, MSG_RESPONSE);
    let body = response.get("body").unwrap();
    assert!(body.get("processes_total").unwrap().as_u64().unwrap() >= 1);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_check_rate_limit() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (msg_type, response) = round_trip(
        &mut stream,
        "kernel",
        "CheckRateLimit",
        serde_json::json!({
            "user_id": "rl-user",
            "endpoint": "CreateProcess",
            "record": true,
        }),
    )
    .await;

    assert_eq!(msg_type, MSG_RESPONSE);
    let body = response.get("body").unwrap();
    assert_eq!(body.get("allowed").unwrap().as_bool().unwrap(), true);
}

// =============================================================================
// Orchestration service tests
// =============================================================================

#[tokio::test]
async fn test_initialize_and_advance_orchestration() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    round_trip(
        &mut stream,
        "kernel",
        "CreateProcess",
        serde_json::json!({
            "pid": "orch-proc",
            "request_id": "req-o",
            "user_id": "user-o",
            "session_id": "sess-o",
            "priority": "NORMAL",
        }),
    )
    .await;

    let pipeline_config = serde_json::json!({
        "name": "test-pipeline",
        "agents": [
            {"name": "classify"},
            {"name": "respond"}
        ],
        "max_iterations": 5,
        "max_llm_calls": 100,
        "max_agent_hops": 20,
        "edge_limits": []
    });

    let envelope_req = serde_json::json!({
        "process_id": "orch-proc",
        "pipeline_config": pipeline_config,
        "force": false,
    });

    let (msg_type, response) = round_trip(
        &mut stream,
        "orchestration",
        "InitializeSession",
        envelope_req,
    )
    .await;
    assert_eq!(msg_type, MSG_ERROR);
    // envelope is a required field — omitting it is a validation error.
    let error = response.get("error").unwrap();
    assert_eq!(error.get("code").unwrap().as_str().unwrap(), "INVALID_ARGUMENT");

    let envelope = serde_json::to_value(jeeves_core::envelope::Envelope::new()).unwrap();

    let (msg_type, response) = round_trip(
        &mut stream,
        "orchestration",
        "InitializeSession",
        serde_json::json!({
            "process_id": "orch-proc",
            "pipeline_config": pipeline_config,
            "envelope": envelope,
            "force": false,
        }),
    )
    .await;
    assert_eq!(msg_type, MSG_RESPONSE);
    let body = response.get("body").unwrap();
    assert_eq!(body.get("kind").unwrap().as_str().unwrap(), "RUN_AGENT");
    assert_eq!(body.get("agent_name").unwrap().as_str().unwrap(), "classify");

    let (msg_type, _response) = round_trip(
        &mut stream,
        "orchestration",
        "GetSessionState",
        serde_json::json!({"process_id": "orch-proc"}),
    )
    .await;
    assert_eq!(msg_type, MSG_RESPONSE);
}

// =============================================================================
// CommBus service tests
// =============================================================================

#[tokio::test]
async fn test_commbus_publish() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (msg_type, response) = round_trip(
        &mut stream,
        "commbus",
        "Publish",
        serde_json::json!({
            "event_type": "test.event",
            "payload": "{}",
            "source": "integration-test",
        }),
    ).await;

    assert_eq!(msg_type, MSG_RESPONSE);
    assert_eq!(response.get("ok").unwrap().as_bool().unwrap(), true);
    let body = response.get("body").unwrap();
    assert_eq!(body.get("success").unwrap().as_bool().unwrap(), true);
}

#[tokio::test]
async fn test_commbus_send() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (msg_type, _response) = round_trip(
        &mut stream,
        "commbus",
        "Send",
        serde_json::json!({
            "command_type": "test.command",
            "payload": "{\"key\": \"value\"}",
            "source": "integration-test",
        }),
    ).await;

    // Send with no registered handler returns an error
    assert_eq!(msg_type, MSG_ERROR);
}

#[tokio::test]
async fn test_commbus_query_no_handler() {
    let (addr, _handle) = start_test_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let (msg_type, _response) = round_trip(
        &mut stream,
        "commbus",
        "Query",
        serde_json::json!({
            "query_type": "test.query",
            "payload": "{}",
            "source": "integration-test",
            "timeout_ms": 500,
        }),
    ).await;

    // Query with no registered handler returns an error
    assert_eq!(msg_type, MSG_ERROR);
}

#[tokio::test]
async fn test_commbus_subscribe_stream() {
    let (addr, _handle) = start_test_server().await;

    // Connection 1: subscribe to events
    let mut sub_stream = TcpStream::connect(addr).await.unwrap();
    let sub_request = serde_json::json!({
        "id": "sub-1",
        "service": "commbus",
        "method": "Subscribe",
        "body": {
            "event_types": ["test.stream"],
            "subscriber_id": "test-sub-1",
        },
    });
    let payload = rmp_serde::to_vec_named(&sub_request).unwrap();
    write_frame(&mut sub_stream, MSG_REQUEST, &payload).await.unwrap();

    // Give subscription time to register
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // Connection 2: publish events that the subscriber is listening for
    let mut pub_stream = TcpStream::connect(addr).await.unwrap();
    for i in 0..3 {
        let (msg_type, response) = round_trip(
            &mut pub_stream,
            "commbus",
            "Publish",
            serde_json::json!({
                "event_type": "test.stream",
                "payload": format!("{{\"seq\": {}}}", i),
                "source": "stream-test",
            }),
        ).await;
        assert_eq!(msg_type, MSG_RESPONSE);
        assert_eq!(response.get("ok").unwrap().as_bool().unwrap(), true);
    }

    // Read stream chunks from the subscriber connection
    let mut chunks = Vec::new();
    for _ in 0..3 {
        let mut len_buf = [0u8; 4];
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sub_stream.read_exact(&mut len_buf),
        ).await.expect("Timed out waiting for stream chunk").unwrap();

        let frame_len = u32::from_be_bytes(len_buf) as usize;
        let mut frame_data = vec![0u8; frame_len];
        sub_stream.read_exact(&mut frame_data).await.unwrap();

        assert_eq!(frame_data[0], MSG_STREAM_CHUNK);
        let chunk: serde_json::Value = rmp_serde::from_slice(&frame_data[1..]).unwrap();
        chunks.push(chunk);
    }

    assert_eq!(chunks.len(), 3);
    // Each chunk should have the event_type in the body
    for chunk in &chunks {
        let body = chunk.get("body").unwrap();
        assert_eq!(body.get("event_type").unwrap().as_str().unwrap(), "test.stream");
        assert_eq!(body.get("source").unwrap().as_str().unwrap(), "stream-test");
    }

    // Drop the subscriber — server should send MSG_STREAM_END when it detects disconnect,
    // but since we're closing from the client side, we just verify the chunks arrived.
    drop(sub_stream);
}
