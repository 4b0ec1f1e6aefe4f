use super::*;
use crate::mcp::transport::{Inbound, InboundSender};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;

type Responder = Box<dyn Fn(&JsonRpcRequest) -> Option<Value> + Send + Sync>;

/// In-memory transport that answers requests through a closure
struct MockTransport {
    inbound: Mutex<Option<InboundSender>>,
    sent: Mutex<Vec<JsonRpcMessage>>,
    respond: Responder,
    /// When set, requests fail to send with this reason
    broken: Mutex<Option<String>>,
}

impl MockTransport {
    fn push(&self, inbound: Inbound) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            tx.send(inbound).unwrap();
        }
    }

    fn inject(&self, message: JsonRpcMessage) {
        self.push(Inbound::message(message));
    }

    /// Deliver a message as if it arrived on the reply stream of `related`
    fn inject_related(&self, message: JsonRpcMessage, related: RequestId) {
        self.push(Inbound::Message {
            message,
            related: Some(related),
        });
    }

    fn sent_requests(&self) -> Vec<JsonRpcRequest> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Request(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    /// Drop the inbound sender as if the server process died
    fn hang_up(&self) {
        self.inbound.lock().take();
    }

    fn sent_responses(&self) -> Vec<JsonRpcResponse> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Response(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    fn sent_notifications(&self) -> Vec<JsonRpcNotification> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Notification(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if let JsonRpcMessage::Request(_) = message
            && let Some(reason) = self.broken.lock().clone()
        {
            return Err(ScopeError::connection(reason));
        }
        if let JsonRpcMessage::Request(ref request) = message
            && let Some(result) = (self.respond)(request)
        {
            self.inject(JsonRpcMessage::Response(JsonRpcResponse::success(
                request.id.clone(),
                result,
            )));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.hang_up();
    }
}

fn connection_with(
    respond: Responder,
    timeout: Duration,
) -> (Arc<ServerConnection>, Arc<MockTransport>, Arc<ServerBindings>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(MockTransport {
        inbound: Mutex::new(Some(tx)),
        sent: Mutex::new(Vec::new()),
        respond,
        broken: Mutex::new(None),
    });
    let bindings = Arc::new(ServerBindings::new());
    let connection = ServerConnection::with_transport(
        "mock",
        ServerConfig::stdio("mock-server", vec![]),
        transport.clone(),
        rx,
        bindings.clone(),
        timeout,
    );
    (connection, transport, bindings)
}

fn answer_everything() -> Responder {
    Box::new(|request: &JsonRpcRequest| match request.method.as_str() {
        "initialize" => Some(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock", "version": "1.0.0"}
        })),
        "slow" | "tools/call" => None,
        _ => Some(json!({"echo": request.method})),
    })
}

fn tool_error(id: i64) -> JsonRpcMessage {
    JsonRpcMessage::Response(JsonRpcResponse::success(
        RequestId::Number(id),
        json!({"content": [{"type": "text", "text": "failed"}], "isError": true}),
    ))
}

fn expiring_elicitations(bindings: &ServerBindings) {
    bindings.set_elicitation_handler(Arc::new(|_: ElicitationRequest| {
        async { Err(ScopeError::ElicitationTimeout("nobody answered".into())) }.boxed()
    }));
}

fn elicitation_request(id: &str) -> JsonRpcMessage {
    JsonRpcMessage::Request(JsonRpcRequest::new(
        RequestId::String(id.into()),
        METHOD_ELICITATION_CREATE,
        Some(json!({"message": "Continue?"})),
    ))
}

/// Start `count` tool calls one after another so their ids are sequential
async fn start_tool_calls(
    connection: &Arc<ServerConnection>,
    transport: &Arc<MockTransport>,
    count: usize,
) -> Vec<tokio::task::JoinHandle<ToolCallOutcome>> {
    let before = transport.sent_requests().len();
    let mut calls = Vec::new();
    for n in before + 1..=before + count {
        let connection = connection.clone();
        calls.push(tokio::spawn(async move {
            connection.call_tool(json!({"name": "work", "arguments": {}})).await
        }));
        wait_until(|| transport.sent_requests().len() == n).await;
    }
    calls
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

#[tokio::test]
async fn test_handshake_marks_connected() {
    let (connection, transport, _) = connection_with(answer_everything(), Duration::from_secs(5));
    connection.handshake().await.unwrap();

    assert_eq!(connection.status(), ConnectionStatus::Connected);
    assert_eq!(connection.server_info().unwrap().name, "mock");
    assert_eq!(connection.protocol_version().as_deref(), Some("2025-06-18"));

    let notifications = transport.sent_notifications();
    assert_eq!(notifications[0].method, METHOD_INITIALIZED);
}

#[tokio::test]
async fn test_request_resolves_with_matching_response() {
    let (connection, _, _) = connection_with(answer_everything(), Duration::from_secs(5));
    let result = connection.request("tools/list", None).await.unwrap();
    assert_eq!(result, json!({"echo": "tools/list"}));
}

#[tokio::test]
async fn test_timeout_sends_cancellation() {
    let (connection, transport, _) = connection_with(answer_everything(), Duration::from_millis(30));

    let err = connection.request("slow", None).await.unwrap_err();
    assert!(matches!(err, ScopeError::Timeout { ref method, .. } if method == "slow"));

    let cancelled = transport
        .sent_notifications()
        .into_iter()
        .find(|n| n.method == METHOD_CANCELLED)
        .expect("cancellation notification");
    assert_eq!(cancelled.params.unwrap()["requestId"], json!(1));
}

#[tokio::test]
async fn test_protocol_error_is_surfaced() {
    let (connection, transport, _) = connection_with(answer_everything(), Duration::from_secs(5));

    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.request("slow", None).await })
    };
    wait_until(|| !transport.sent.lock().is_empty()).await;
    transport.inject(JsonRpcMessage::Response(JsonRpcResponse::failure(
        RequestId::Number(1),
        -32602,
        "bad params",
    )));

    match pending.await.unwrap() {
        Err(ScopeError::Protocol { code, .. }) => assert_eq!(code, -32602),
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_notification_reaches_handler() {
    let (_connection, transport, bindings) = connection_with(answer_everything(), Duration::from_secs(5));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        bindings.set_notification_handler(
            "notifications/resources/updated",
            Arc::new(move |n: ServerNotification| seen.lock().push(n)),
        );
    }

    transport.inject(JsonRpcMessage::Notification(JsonRpcNotification::new(
        "notifications/resources/updated",
        Some(json!({"uri": "demo://greeting"})),
    )));
    // No handler for this one; it is dropped
    transport.inject(JsonRpcMessage::Notification(JsonRpcNotification::new(
        "notifications/message",
        None,
    )));

    wait_until(|| !seen.lock().is_empty()).await;
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].server_id, "mock");
    assert_eq!(seen[0].params["uri"], "demo://greeting");
}

#[tokio::test]
async fn test_server_requests_are_answered() {
    let (_connection, transport, _) = connection_with(answer_everything(), Duration::from_secs(5));

    transport.inject(JsonRpcMessage::Request(JsonRpcRequest::new(
        RequestId::String("p1".into()),
        "ping",
        None,
    )));
    transport.inject(JsonRpcMessage::Request(JsonRpcRequest::new(
        RequestId::String("s1".into()),
        "sampling/createMessage",
        None,
    )));

    wait_until(|| transport.sent_responses().len() == 2).await;
    let responses = transport.sent_responses();

    let ping = responses
        .iter()
        .find(|r| r.id == RequestId::String("p1".into()))
        .unwrap();
    assert_eq!(ping.result, Some(json!({})));

    let unknown = responses
        .iter()
        .find(|r| r.id == RequestId::String("s1".into()))
        .unwrap();
    assert_eq!(unknown.error.as_ref().unwrap().code, JSONRPC_METHOD_NOT_FOUND);
}

#[tokio::test]
async fn test_elicitation_without_handler_declines() {
    let (_connection, transport, _) = connection_with(answer_everything(), Duration::from_secs(5));

    transport.inject(JsonRpcMessage::Request(JsonRpcRequest::new(
        RequestId::Number(99),
        METHOD_ELICITATION_CREATE,
        Some(json!({"message": "Proceed?", "requestedSchema": {"type": "object"}})),
    )));

    wait_until(|| !transport.sent_responses().is_empty()).await;
    let response = &transport.sent_responses()[0];
    assert_eq!(response.result, Some(json!({"action": "decline"})));
}

#[tokio::test]
async fn test_elicitation_handler_answer_and_timeout() {
    let (connection, transport, bindings) = connection_with(answer_everything(), Duration::from_secs(5));

    bindings.set_elicitation_handler(Arc::new(|request: ElicitationRequest| {
        async move {
            if request.message == "expire" {
                Err(ScopeError::ElicitationTimeout("nobody answered".into()))
            } else {
                Ok(ElicitationResponse::accept(json!({"name": "Ada"})))
            }
        }
        .boxed()
    }));

    transport.inject(JsonRpcMessage::Request(JsonRpcRequest::new(
        RequestId::Number(1),
        METHOD_ELICITATION_CREATE,
        Some(json!({"message": "Name?"})),
    )));
    transport.inject(JsonRpcMessage::Request(JsonRpcRequest::new(
        RequestId::Number(2),
        METHOD_ELICITATION_CREATE,
        Some(json!({"message": "expire"})),
    )));

    wait_until(|| transport.sent_responses().len() == 2).await;
    let responses = transport.sent_responses();

    let accepted = responses.iter().find(|r| r.id == RequestId::Number(1)).unwrap();
    assert_eq!(
        accepted.result,
        Some(json!({"action": "accept", "content": {"name": "Ada"}}))
    );

    let expired = responses.iter().find(|r| r.id == RequestId::Number(2)).unwrap();
    assert_eq!(expired.error.as_ref().unwrap().code, JSONRPC_ELICITATION_TIMEOUT);
}

#[tokio::test]
async fn test_expired_elicitation_marks_call_that_carried_it() {
    let (connection, transport, bindings) = connection_with(answer_everything(), Duration::from_secs(5));
    expiring_elicitations(&bindings);
    let calls = start_tool_calls(&connection, &transport, 2).await;

    transport.inject_related(elicitation_request("e1"), RequestId::Number(2));
    wait_until(|| transport.sent_responses().len() == 1).await;

    transport.inject(tool_error(1));
    transport.inject(tool_error(2));
    let mut outcomes = Vec::new();
    for call in calls {
        outcomes.push(call.await.unwrap());
    }

    assert!(outcomes[0].result.is_ok());
    assert!(!outcomes[0].elicitation_expired);
    assert!(outcomes[1].elicitation_expired);
}

#[tokio::test]
async fn test_expired_elicitation_with_concurrent_calls_marks_nobody() {
    let (connection, transport, bindings) = connection_with(answer_everything(), Duration::from_secs(5));
    expiring_elicitations(&bindings);
    let calls = start_tool_calls(&connection, &transport, 2).await;

    // Nothing ties the elicitation to either call
    transport.inject(elicitation_request("e1"));
    wait_until(|| transport.sent_responses().len() == 1).await;

    transport.inject(tool_error(1));
    transport.inject(tool_error(2));
    for call in calls {
        let outcome = call.await.unwrap();
        assert!(outcome.result.is_ok());
        assert!(!outcome.elicitation_expired);
    }
}

#[tokio::test]
async fn test_expired_elicitation_marks_sole_call() {
    let (connection, transport, bindings) = connection_with(answer_everything(), Duration::from_secs(5));
    expiring_elicitations(&bindings);
    let mut calls = start_tool_calls(&connection, &transport, 1).await;

    transport.inject(elicitation_request("e1"));
    wait_until(|| transport.sent_responses().len() == 1).await;
    transport.inject(tool_error(1));

    let outcome = calls.remove(0).await.unwrap();
    assert!(outcome.elicitation_expired);

    // The next call starts clean
    let mut calls = start_tool_calls(&connection, &transport, 1).await;
    transport.inject(tool_error(2));
    assert!(!calls.remove(0).await.unwrap().elicitation_expired);
}

#[tokio::test]
async fn test_send_failure_marks_error() {
    let (connection, transport, _) = connection_with(answer_everything(), Duration::from_secs(5));
    *transport.broken.lock() = Some("HTTP 502 Bad Gateway".to_string());

    let err = connection.request("tools/list", None).await.unwrap_err();
    assert!(matches!(err, ScopeError::Connection(ref reason) if reason.contains("502")));
    assert_eq!(connection.status(), ConnectionStatus::Error);
    assert_eq!(connection.last_error().as_deref(), Some("HTTP 502 Bad Gateway"));
    assert!(connection.pending.is_empty());
}

#[tokio::test]
async fn test_unanswered_reply_stream_fails_request() {
    let (connection, transport, _) = connection_with(answer_everything(), Duration::from_secs(5));

    let in_flight = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.request("slow", None).await })
    };
    wait_until(|| transport.sent_requests().len() == 1).await;
    transport.push(Inbound::Unanswered {
        request: RequestId::Number(1),
        error: "reply stream ended".to_string(),
    });

    let started = Instant::now();
    let err = in_flight.await.unwrap().unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(err, ScopeError::Connection(_)));
    assert_eq!(connection.status(), ConnectionStatus::Error);
    assert_eq!(connection.last_error().as_deref(), Some("reply stream ended"));
}

#[tokio::test]
async fn test_close_fails_in_flight_requests() {
    let (connection, _, _) = connection_with(answer_everything(), Duration::from_secs(5));

    let in_flight = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.request("slow", None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    connection.close().await;

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, ScopeError::Connection(_)));
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);

    // Later requests fail fast
    assert!(matches!(
        connection.request("tools/list", None).await,
        Err(ScopeError::Connection(_))
    ));
}

#[tokio::test]
async fn test_transport_hang_up_marks_error() {
    let (connection, transport, _) = connection_with(answer_everything(), Duration::from_secs(5));

    let in_flight = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.request("slow", None).await })
    };
    wait_until(|| !transport.sent.lock().is_empty()).await;
    transport.hang_up();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, ScopeError::Connection(_)));
    assert_eq!(connection.status(), ConnectionStatus::Error);
    assert!(connection.last_error().is_some());
}
