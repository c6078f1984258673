//! Edge case integration tests for agentic-protocol.
//!
//! Covers the handshake, correlation, cancellation, timeouts, progress,
//! capability gating, logging, and connection teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use agentic_protocol::config::ProtocolOptions;
use agentic_protocol::protocol::{
    CancellationToken, ConnectionState, Protocol, RequestContext, RequestOptions,
};
use agentic_protocol::transport::{
    InMemoryTransport, StdioTransport, Transport, TransportEvent, TransportEvents,
};
use agentic_protocol::types::*;

// ─────────────────────── helpers ───────────────────────

const WAIT: Duration = Duration::from_secs(2);

fn client_with(caps: Capabilities) -> Protocol {
    Protocol::client(
        Implementation::new("test-client", "1.0"),
        caps,
        ProtocolOptions::default(),
    )
}

fn server_with(caps: Capabilities) -> Protocol {
    Protocol::server(
        Implementation::new("test-server", "2.0"),
        caps,
        ProtocolOptions::default(),
    )
}

/// Connect both engines over an in-memory pair and wait for the handshake.
async fn connect(client: &Protocol, server: &Protocol) {
    let (client_end, server_end) = InMemoryTransport::pair();
    server.connect(server_end).await.unwrap();
    client.connect(client_end).await.unwrap();
    timeout(WAIT, server.ready()).await.unwrap().unwrap();
}

async fn connected_pair(client_caps: Capabilities, server_caps: Capabilities) -> (Protocol, Protocol) {
    let client = client_with(client_caps);
    let server = server_with(server_caps);
    connect(&client, &server).await;
    (client, server)
}

/// The far end of a transport, driven by hand.
struct RawPeer {
    transport: InMemoryTransport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl RawPeer {
    async fn pair() -> (InMemoryTransport, RawPeer) {
        let (ours, theirs) = InMemoryTransport::pair();
        let (tx, events) = mpsc::unbounded_channel();
        theirs.start(tx).await.unwrap();
        (
            ours,
            RawPeer {
                transport: theirs,
                events,
            },
        )
    }

    fn send(&self, value: Value) {
        self.transport.send_value(value).unwrap();
    }

    async fn recv(&mut self) -> Value {
        match timeout(WAIT, self.events.recv()).await {
            Ok(Some(TransportEvent::Message(value))) => value,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// True if nothing arrives within `ms`.
    async fn silent_for(&mut self, ms: u64) -> bool {
        timeout(Duration::from_millis(ms), self.events.recv())
            .await
            .is_err()
    }
}

fn mcp_request(id: i64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params
    })
}

fn mcp_notification(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params
    })
}

fn init_request(version: &str) -> Value {
    mcp_request(
        0,
        "initialize",
        json!({
            "protocolVersion": version,
            "capabilities": {},
            "clientInfo": { "name": "raw-client", "version": "0.1" }
        }),
    )
}

/// Play the initiator by hand against a real responder.
async fn raw_client_handshake(raw: &mut RawPeer, server: &Protocol) {
    raw.send(init_request(LATEST_PROTOCOL_VERSION));
    let response = raw.recv().await;
    assert_eq!(response["id"], 0);
    raw.send(mcp_notification("notifications/initialized", json!({})));
    timeout(WAIT, server.ready()).await.unwrap().unwrap();
}

/// Play the responder by hand against a real initiator.
async fn raw_server_handshake(raw: &mut RawPeer, version: &str) {
    let init = raw.recv().await;
    assert_eq!(init["method"], "initialize");
    raw.send(json!({
        "jsonrpc": "2.0",
        "id": init["id"],
        "result": {
            "protocolVersion": version,
            "capabilities": {},
            "serverInfo": { "name": "raw-server", "version": "0.1" }
        }
    }));
}

/// Install a handler that parks until cancelled and reports the reason.
fn install_cancel_watcher(server: &Protocol, method: &str) -> mpsc::UnboundedReceiver<Option<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    server
        .set_raw_request_handler(method, move |_, ctx: RequestContext| {
            let tx = tx.clone();
            async move {
                ctx.cancellation().cancelled().await;
                let _ = tx.send(ctx.cancellation().reason());
                Ok(Value::Null)
            }
        })
        .unwrap();
    rx
}

async fn wait_for_pending(protocol: &Protocol, count: usize) {
    timeout(WAIT, async {
        while protocol.pending_requests() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pending count never reached");
}

#[derive(Debug, Serialize, Deserialize)]
struct AddParams {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddResult {
    sum: i64,
}

struct Add;

impl Request for Add {
    const METHOD: &'static str = "math/add";
    type Params = AddParams;
    type Result = AddResult;
}

// ═══════════════════════════════════════════════════════
// HANDSHAKE
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_01_handshake_negotiates_latest_version() {
    let (client, server) = connected_pair(
        Capabilities::new().enable("sampling"),
        Capabilities::server_defaults(),
    )
    .await;

    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(server.state(), ConnectionState::Ready);
    assert_eq!(client.protocol_version().as_deref(), Some(LATEST_PROTOCOL_VERSION));

    let server_caps = client.peer_capabilities().unwrap();
    assert!(server_caps.supports("logging"));
    let client_info = server.peer_info().unwrap();
    assert_eq!(client_info.implementation.name, "test-client");
    assert!(client_info.capabilities.supports("sampling"));
}

#[tokio::test]
async fn test_02_older_version_is_echoed_and_ready_waits_for_initialized() {
    let server = server_with(Capabilities::server_defaults());
    server.set_instructions("Use the echo tool.");
    let (ours, mut raw) = RawPeer::pair().await;
    server.connect(ours).await.unwrap();

    raw.send(init_request("2024-11-05"));
    let response = raw.recv().await;
    assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(response["result"]["serverInfo"]["name"], "test-server");
    assert_eq!(response["result"]["instructions"], "Use the echo tool.");
    assert_eq!(server.state(), ConnectionState::Handshaking);

    raw.send(mcp_notification("notifications/initialized", json!({})));
    timeout(WAIT, server.ready()).await.unwrap().unwrap();
    assert_eq!(server.protocol_version().as_deref(), Some("2024-11-05"));
}

#[tokio::test]
async fn test_03_unknown_requested_version_gets_latest() {
    let server = server_with(Capabilities::new());
    let (ours, mut raw) = RawPeer::pair().await;
    server.connect(ours).await.unwrap();

    raw.send(init_request("1999-01-01"));
    let response = raw.recv().await;
    assert_eq!(response["result"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
}

#[tokio::test]
async fn test_04_unsupported_responder_version_fails_handshake() {
    let client = client_with(Capabilities::new());
    let (ours, mut raw) = RawPeer::pair().await;

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(ours).await })
    };
    raw_server_handshake(&mut raw, "1999-01-01").await;

    let err = timeout(WAIT, connecting).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, McpError::UnsupportedProtocolVersion(ref v) if v == "1999-01-01"));
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_05_connect_twice_fails() {
    let (client, _server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let (again, _other) = InMemoryTransport::pair();
    assert!(matches!(
        client.connect(again).await,
        Err(McpError::AlreadyConnected)
    ));
}

// ═══════════════════════════════════════════════════════
// REQUESTS AND HANDLERS
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_06_concurrent_requests_correlate_by_id() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    server
        .set_raw_request_handler("test/delay", |params, _| async move {
            let params = params.unwrap_or(Value::Null);
            let delay = params["delay"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(params["tag"].clone())
        })
        .unwrap();

    let call = |delay: u64, tag: &'static str| {
        let client = client.clone();
        async move {
            client
                .request_raw(
                    "test/delay",
                    Some(json!({"delay": delay, "tag": tag})),
                    RequestOptions::default(),
                )
                .await
                .unwrap()
        }
    };

    let (a, b, c) = tokio::join!(call(60, "a"), call(10, "b"), call(30, "c"));
    assert_eq!((a, b, c), (json!("a"), json!("b"), json!("c")));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn test_07_typed_request_and_invalid_params() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    server
        .set_request_handler::<Add, _, _>(|params, _| async move {
            Ok(AddResult {
                sum: params.a + params.b,
            })
        })
        .unwrap();

    let result = client
        .request::<Add>(AddParams { a: 2, b: 40 }, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result.sum, 42);

    let err = client
        .request_raw("math/add", Some(json!({"a": "two"})), RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), error_codes::INVALID_PARAMS);
}

#[tokio::test]
async fn test_08_unknown_method_is_method_not_found() {
    let (client, _server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let err = client
        .request_raw("does/not/exist", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), error_codes::METHOD_NOT_FOUND);
    assert!(matches!(err, McpError::Rpc { .. }));
}

#[tokio::test]
async fn test_09_fallback_and_removal() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    server
        .set_raw_request_handler("test/exact", |_, _| async { Ok(json!("exact")) })
        .unwrap();
    server.set_fallback_request_handler(|method, _, _| async move { Ok(json!(method)) });

    let exact = client
        .request_raw("test/exact", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(exact, json!("exact"));

    let other = client
        .request_raw("test/other", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(other, json!("test/other"));

    assert!(server.remove_request_handler("test/exact"));
    server.remove_fallback_request_handler();
    let err = client
        .request_raw("test/exact", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), error_codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_10_handler_error_is_forwarded() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    server
        .set_raw_request_handler("test/fail", |_, _| async {
            Err(McpError::Rpc {
                code: -32050,
                message: "quota exceeded".to_string(),
                data: Some(json!({"retryAfter": 5})),
            })
        })
        .unwrap();

    let err = client
        .request_raw("test/fail", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), -32050);
    assert_eq!(err.data(), Some(&json!({"retryAfter": 5})));
}

#[tokio::test]
async fn test_11_panicking_handler_does_not_kill_connection() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    server
        .set_raw_request_handler("test/panic", |_, _| async {
            if true {
                panic!("handler blew up");
            }
            Ok(Value::Null)
        })
        .unwrap();

    let err = client
        .request_raw("test/panic", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), error_codes::INTERNAL_ERROR);
    client.ping().await.unwrap();
}

#[tokio::test]
async fn test_12_nested_request_from_handler() {
    let (client, server) = connected_pair(
        Capabilities::new().enable("roots"),
        Capabilities::new(),
    )
    .await;
    client
        .set_raw_request_handler("roots/list", |_, _| async {
            Ok(json!({"roots": [{"uri": "file:///work"}]}))
        })
        .unwrap();
    server
        .set_raw_request_handler("test/nested", |_, ctx: RequestContext| async move {
            let roots = ctx
                .peer()
                .request_raw("roots/list", None, RequestOptions::default())
                .await?;
            Ok(roots["roots"].clone())
        })
        .unwrap();

    let result = timeout(
        WAIT,
        client.request_raw("test/nested", None, RequestOptions::default()),
    )
    .await
    .expect("nested request deadlocked")
    .unwrap();
    assert_eq!(result, json!([{"uri": "file:///work"}]));
}

#[tokio::test]
async fn test_13_ping_both_directions() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    tokio_test::assert_ok!(client.ping().await);
    tokio_test::assert_ok!(server.ping().await);
}

// ═══════════════════════════════════════════════════════
// CAPABILITY GATING
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_14_handler_registration_requires_local_capability() {
    let server = server_with(Capabilities::new());
    let err = server
        .set_raw_request_handler("tools/call", |_, _| async { Ok(Value::Null) })
        .unwrap_err();
    assert!(matches!(err, McpError::CapabilityNotSupported(_)));

    let server = server_with(Capabilities::new().enable("tools"));
    assert!(server
        .set_raw_request_handler("tools/call", |_, _| async { Ok(Value::Null) })
        .is_ok());
}

#[tokio::test]
async fn test_15_server_request_needs_client_capability() {
    let server = server_with(Capabilities::new());
    let (ours, mut raw) = RawPeer::pair().await;
    server.connect(ours).await.unwrap();
    raw_client_handshake(&mut raw, &server).await;

    let err = server
        .request_raw("sampling/createMessage", Some(json!({})), RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::CapabilityNotSupported(_)));
    assert!(raw.silent_for(100).await, "nothing should reach the wire");
    assert_eq!(server.pending_requests(), 0);
}

#[tokio::test]
async fn test_16_strict_client_checks_server_capability() {
    let client = Protocol::client(
        Implementation::new("strict-client", "1.0"),
        Capabilities::new(),
        ProtocolOptions::default().with_strict_capabilities(true),
    );
    let server = server_with(Capabilities::new());
    connect(&client, &server).await;

    let err = client
        .request_raw("tools/list", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::CapabilityNotSupported(_)));
}

#[tokio::test]
async fn test_17_notification_needs_local_capability() {
    let (_client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let err = server
        .notify_raw("notifications/tools/list_changed", None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::CapabilityNotSupported(_)));
}

// ═══════════════════════════════════════════════════════
// CANCELLATION AND TIMEOUTS
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_18_caller_cancellation_reaches_handler() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let mut seen = install_cancel_watcher(&server, "test/slow");

    let token = CancellationToken::new();
    let call = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move {
            client
                .request_raw(
                    "test/slow",
                    None,
                    RequestOptions::default().with_cancellation(token),
                )
                .await
        })
    };
    wait_for_pending(&client, 1).await;
    token.cancel_with_reason("user abort");

    let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, McpError::Cancelled(ref reason) if reason == "user abort"));
    assert_eq!(client.pending_requests(), 0);

    let reason = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(reason.as_deref(), Some("user abort"));
}

#[tokio::test]
async fn test_19_no_response_after_peer_cancel() {
    let server = server_with(Capabilities::new());
    let mut seen = install_cancel_watcher(&server, "test/slow");
    let (ours, mut raw) = RawPeer::pair().await;
    server.connect(ours).await.unwrap();
    raw_client_handshake(&mut raw, &server).await;

    raw.send(mcp_request(5, "test/slow", json!({})));
    tokio::time::sleep(Duration::from_millis(30)).await;
    raw.send(mcp_notification(
        "notifications/cancelled",
        json!({"requestId": 5, "reason": "changed my mind"}),
    ));

    let reason = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(reason.as_deref(), Some("changed my mind"));
    assert!(raw.silent_for(150).await, "cancelled request must not be answered");
}

#[tokio::test]
async fn test_20_zero_timeout_rejects_and_cancels_peer() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let mut seen = install_cancel_watcher(&server, "test/slow");

    let err = client
        .request_raw(
            "test/slow",
            None,
            RequestOptions::default().with_timeout(Duration::ZERO),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), error_codes::REQUEST_TIMEOUT);
    assert!(matches!(err, McpError::RequestTimeout { .. }));
    assert_eq!(client.pending_requests(), 0);

    let reason = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert!(reason.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_21_late_response_after_timeout_is_ignored() {
    let client = client_with(Capabilities::new());
    let errors = Arc::new(AtomicUsize::new(0));
    {
        let errors = errors.clone();
        client.on_error(move |_| {
            errors.fetch_add(1, Ordering::SeqCst);
        });
    }
    let (ours, mut raw) = RawPeer::pair().await;
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(ours).await })
    };
    raw_server_handshake(&mut raw, LATEST_PROTOCOL_VERSION).await;
    timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();
    assert_eq!(raw.recv().await["method"], "notifications/initialized");

    let err = client
        .request_raw(
            "test/late",
            None,
            RequestOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::RequestTimeout { .. }));

    let request = raw.recv().await;
    assert_eq!(request["method"], "test/late");
    let cancelled = raw.recv().await;
    assert_eq!(cancelled["method"], "notifications/cancelled");
    assert_eq!(cancelled["params"]["requestId"], request["id"]);

    raw.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"late": true}}));

    let pinging = {
        let client = client.clone();
        tokio::spawn(async move { client.ping().await })
    };
    let ping = raw.recv().await;
    assert_eq!(ping["method"], "ping");
    raw.send(json!({"jsonrpc": "2.0", "id": ping["id"], "result": {}}));
    timeout(WAIT, pinging).await.unwrap().unwrap().unwrap();
    assert_eq!(errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_22_dropped_caller_cancels_peer() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let mut seen = install_cancel_watcher(&server, "test/slow");

    let abandoned = timeout(
        Duration::from_millis(50),
        client.request_raw("test/slow", None, RequestOptions::default()),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(client.pending_requests(), 0);

    let reason = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(reason.as_deref(), Some("request abandoned"));
}

#[tokio::test]
async fn test_23_initialize_is_not_cancellable() {
    let client = client_with(Capabilities::new());
    let params = InitializeParams {
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        capabilities: Capabilities::new(),
        client_info: Implementation::new("test-client", "1.0"),
    };
    let err = client
        .request::<Initialize>(
            params,
            RequestOptions::default().with_cancellation(CancellationToken::new()),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::NotCancellable(_)));
}

// ═══════════════════════════════════════════════════════
// PROGRESS
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_24_progress_keeps_request_alive() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    server
        .set_raw_request_handler("test/progress", |_, ctx: RequestContext| async move {
            for step in 1..=4 {
                tokio::time::sleep(Duration::from_millis(60)).await;
                ctx.send_progress(step as f64, Some(4.0), None).await?;
            }
            Ok(json!("done"))
        })
        .unwrap();

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let options = RequestOptions::default()
        .with_timeout(Duration::from_millis(150))
        .reset_on_progress(Duration::from_secs(5))
        .with_progress("job-1", move |params| {
            assert_eq!(params.total, Some(4.0));
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let result = client
        .request_raw("test/progress", None, options)
        .await
        .unwrap();
    assert_eq!(result, json!("done"));
    assert_eq!(updates.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_25_progress_cannot_exceed_total_ceiling() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let (stopped_tx, mut stopped) = mpsc::unbounded_channel();
    server
        .set_raw_request_handler("test/forever", move |_, ctx: RequestContext| {
            let stopped_tx = stopped_tx.clone();
            async move {
                let mut step = 0.0;
                while !ctx.is_cancelled() {
                    step += 1.0;
                    let _ = ctx.send_progress(step, None, None).await;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                let _ = stopped_tx.send(ctx.cancellation().reason());
                Ok(Value::Null)
            }
        })
        .unwrap();

    let options = RequestOptions::default()
        .with_timeout(Duration::from_millis(200))
        .reset_on_progress(Duration::from_millis(400))
        .with_progress(7i64, |_| {});

    let started = std::time::Instant::now();
    let err = client
        .request_raw("test/forever", None, options)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, McpError::RequestTimeout { .. }));
    assert!(elapsed >= Duration::from_millis(350), "gave up early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(1500), "ceiling ignored: {elapsed:?}");

    timeout(WAIT, stopped.recv())
        .await
        .expect("responder handler never saw the cancellation")
        .expect("handler channel closed");
}

#[tokio::test]
async fn test_25b_progress_past_ceiling_cancels_at_peer() {
    let client = client_with(Capabilities::new());
    let (ours, mut raw) = RawPeer::pair().await;
    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect(ours).await })
    };
    raw_server_handshake(&mut raw, LATEST_PROTOCOL_VERSION).await;
    timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();
    assert_eq!(raw.recv().await["method"], "notifications/initialized");

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = updates.clone();
    let options = RequestOptions::default()
        .with_timeout(Duration::from_secs(10))
        .reset_on_progress(Duration::from_millis(100))
        .with_progress("tok", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request_raw("test/long", None, options).await })
    };

    let request = raw.recv().await;
    assert_eq!(request["params"]["_meta"]["progressToken"], "tok");
    raw.send(mcp_notification(
        "notifications/progress",
        json!({"progressToken": "tok", "progress": 1}),
    ));
    // Hold the runtime past the ceiling so the progress is seen late.
    std::thread::sleep(Duration::from_millis(150));

    let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, McpError::RequestTimeout { .. }));
    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert_eq!(client.pending_requests(), 0);

    let cancelled = raw.recv().await;
    assert_eq!(cancelled["method"], "notifications/cancelled");
    assert_eq!(cancelled["params"]["requestId"], request["id"]);
}

#[tokio::test]
async fn test_26_unmatched_cancel_and_progress_are_ignored() {
    let server = server_with(Capabilities::new());
    let (ours, mut raw) = RawPeer::pair().await;
    server.connect(ours).await.unwrap();
    raw_client_handshake(&mut raw, &server).await;

    raw.send(mcp_notification("notifications/cancelled", json!({"requestId": 999})));
    raw.send(mcp_notification(
        "notifications/progress",
        json!({"progressToken": "ghost", "progress": 1}),
    ));
    raw.send(mcp_request(3, "ping", json!({})));

    let response = raw.recv().await;
    assert_eq!(response["id"], 3);
    assert_eq!(response["result"], json!({}));
}

// ═══════════════════════════════════════════════════════
// NOTIFICATIONS AND LOGGING
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_27_notifications_handled_in_order() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.set_raw_notification_handler("test/tick", move |params| {
        let tx = tx.clone();
        async move {
            let n = params.and_then(|p| p["n"].as_u64()).unwrap_or(u64::MAX);
            if n % 3 == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = tx.send(n);
            Ok(())
        }
    })
    .unwrap();

    for n in 0..20u64 {
        client
            .notify_raw("test/tick", Some(json!({"n": n})))
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while seen.len() < 20 {
        seen.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_28_log_level_filters_messages() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::server_defaults()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    client.set_notification_handler::<LoggingMessage, _, _>(move |params| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(params.level);
            Ok(())
        }
    })
    .unwrap();

    client.set_logging_level(LogLevel::Warning).await.unwrap();

    for level in [LogLevel::Info, LogLevel::Debug, LogLevel::Error] {
        server
            .send_logging_message(LoggingMessageParams {
                level,
                logger: Some("test".to_string()),
                data: json!("record"),
            })
            .await
            .unwrap();
    }

    let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(first, LogLevel::Error);
}

#[tokio::test]
async fn test_29_set_level_requires_logging_capability() {
    let (client, _server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let err = client
        .set_logging_level(LogLevel::Debug)
        .await
        .unwrap_err();
    assert_eq!(err.code(), error_codes::METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_30_malformed_input_reports_parse_error() {
    let server = server_with(Capabilities::new());
    let (tx, mut errors) = mpsc::unbounded_channel();
    server.on_error(move |e| {
        let _ = tx.send(e.code());
    });
    let (ours, mut raw) = RawPeer::pair().await;
    server.connect(ours).await.unwrap();
    raw_client_handshake(&mut raw, &server).await;

    raw.send(json!({"jsonrpc": "2.0", "foo": 1}));
    raw.send(json!({"jsonrpc": "1.0", "method": "ping", "id": 1}));
    raw.send(json!({"jsonrpc": "2.0", "method": "ping", "id": 2, "result": {}}));

    for _ in 0..3 {
        let code = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
        assert_eq!(code, error_codes::PARSE_ERROR);
    }
    assert!(raw.silent_for(100).await, "malformed input must not be answered");
    assert_eq!(server.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_31_empty_method_is_invalid_request() {
    let server = server_with(Capabilities::new());
    let (ours, mut raw) = RawPeer::pair().await;
    server.connect(ours).await.unwrap();
    raw_client_handshake(&mut raw, &server).await;

    raw.send(mcp_request(9, "", json!({})));
    let response = raw.recv().await;
    assert_eq!(response["id"], 9);
    assert_eq!(response["error"]["code"], error_codes::INVALID_REQUEST);
}

// ═══════════════════════════════════════════════════════
// TEARDOWN
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_32_close_rejects_pending_and_is_idempotent() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let _seen = install_cancel_watcher(&server, "test/slow");
    let closes = Arc::new(AtomicUsize::new(0));
    {
        let closes = closes.clone();
        client.on_close(move || {
            closes.fetch_add(1, Ordering::SeqCst);
        });
    }

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request_raw("test/slow", None, RequestOptions::default())
                .await
        })
    };
    wait_for_pending(&client, 1).await;

    client.close().await.unwrap();
    client.close().await.unwrap();

    let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, McpError::ConnectionClosed));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    timeout(WAIT, server.closed()).await.expect("peer should observe closure");
    assert!(matches!(client.ping().await, Err(McpError::ConnectionClosed)));
}

#[tokio::test]
async fn test_33_peer_close_cancels_inbound_handlers() {
    let (client, server) = connected_pair(Capabilities::new(), Capabilities::new()).await;
    let mut seen = install_cancel_watcher(&server, "test/slow");

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request_raw("test/slow", None, RequestOptions::default())
                .await
        })
    };
    wait_for_pending(&client, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    server.close().await.unwrap();
    let reason = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(reason.as_deref(), Some("connection closed"));

    let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, McpError::ConnectionClosed));
    timeout(WAIT, client.closed()).await.unwrap();
}

// ═══════════════════════════════════════════════════════
// STDIO FRAMING
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_34_handshake_over_stdio_streams() {
    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let (server_read, server_write) = tokio::io::split(server_side);

    let client = client_with(Capabilities::new());
    let server = server_with(Capabilities::server_defaults());
    server
        .connect(StdioTransport::with_streams(server_read, server_write))
        .await
        .unwrap();
    client
        .connect(StdioTransport::with_streams(client_read, client_write))
        .await
        .unwrap();
    timeout(WAIT, server.ready()).await.unwrap().unwrap();

    client.ping().await.unwrap();
    assert!(client.session_id().is_none());

    client.close().await.unwrap();
    timeout(WAIT, server.closed()).await.expect("EOF should close the responder");
}

#[tokio::test]
async fn test_35_non_utf8_line_does_not_drop_stdio_connection() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (remote, server_side) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_side);
    let (remote_read, mut remote_write) = tokio::io::split(remote);
    let mut remote_lines = BufReader::new(remote_read).lines();

    let server = server_with(Capabilities::new());
    let (tx, mut errors) = mpsc::unbounded_channel();
    server.on_error(move |e| {
        let _ = tx.send(e.code());
    });
    server
        .connect(StdioTransport::with_streams(server_read, server_write))
        .await
        .unwrap();

    let init = format!("{}\n", init_request(LATEST_PROTOCOL_VERSION));
    remote_write.write_all(init.as_bytes()).await.unwrap();
    let line = timeout(WAIT, remote_lines.next_line()).await.unwrap().unwrap().unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["id"], 0);
    let initialized = format!("{}\n", mcp_notification("notifications/initialized", json!({})));
    remote_write.write_all(initialized.as_bytes()).await.unwrap();
    timeout(WAIT, server.ready()).await.unwrap().unwrap();

    remote_write.write_all(b"\xff\xfe garbage\n").await.unwrap();
    let ping = format!("{}\n", mcp_request(5, "ping", json!({})));
    remote_write.write_all(ping.as_bytes()).await.unwrap();

    let code = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(code, error_codes::PARSE_ERROR);
    let line = timeout(WAIT, remote_lines.next_line()).await.unwrap().unwrap().unwrap();
    let response: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["id"], 5);
    assert_eq!(response["result"], json!({}));
    assert_eq!(server.state(), ConnectionState::Ready);
}

// ═══════════════════════════════════════════════════════
// TRANSPORT FAULTS
// ═══════════════════════════════════════════════════════

/// Delegates to an in-memory transport but refuses to send requests for one method.
struct RefusingTransport {
    inner: InMemoryTransport,
    refused: &'static str,
}

#[async_trait::async_trait]
impl Transport for RefusingTransport {
    async fn start(&self, events: TransportEvents) -> McpResult<()> {
        self.inner.start(events).await
    }

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()> {
        if let JsonRpcMessage::Request(request) = &message {
            if request.method == self.refused {
                return Err(McpError::Transport(format!("write refused for {}", request.method)));
            }
        }
        self.inner.send(message).await
    }

    async fn close(&self) -> McpResult<()> {
        self.inner.close().await
    }

    fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }
}

#[tokio::test]
async fn test_36_send_failure_rejects_only_that_request() {
    let client = client_with(Capabilities::new());
    let server = server_with(Capabilities::new());
    server
        .set_raw_request_handler("test/echo", |params, _| async move {
            Ok(params.unwrap_or(Value::Null))
        })
        .unwrap();
    let (tx, mut errors) = mpsc::unbounded_channel();
    client.on_error(move |e| {
        let _ = tx.send(e.to_string());
    });

    let (client_end, server_end) = InMemoryTransport::pair();
    server.connect(server_end).await.unwrap();
    client
        .connect(RefusingTransport {
            inner: client_end,
            refused: "test/broken",
        })
        .await
        .unwrap();
    timeout(WAIT, server.ready()).await.unwrap().unwrap();

    let err = client
        .request_raw("test/broken", None, RequestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Transport(ref msg) if msg.contains("test/broken")));
    assert_eq!(client.pending_requests(), 0);

    let reported = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert!(reported.contains("test/broken"));

    assert_eq!(client.state(), ConnectionState::Ready);
    let echoed = client
        .request_raw("test/echo", Some(json!({"still": "up"})), RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(echoed, json!({"still": "up"}));
    tokio_test::assert_ok!(client.ping().await);
}
