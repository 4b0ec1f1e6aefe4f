//! End-to-end tests for the interception proxy
//!
//! The full mcpscope router runs on an ephemeral port; upstreams are either
//! wiremock servers or small axum apps.

use axum::{
    Router,
    body::Body,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::{StreamExt, stream};
use mcpscope::config::HttpConfig;
use mcpscope::http::{AppState, build_router};
use mcpscope::interceptor::LogPayload;
use mcpscope::{InterceptorStore, McpManager};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header as header_is, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Scope {
    base: String,
    store: Arc<InterceptorStore>,
    client: reqwest::Client,
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn start_scope() -> Scope {
    let store = Arc::new(InterceptorStore::new(100));
    let state = AppState::new(Arc::new(McpManager::default()), store.clone(), None).unwrap();
    let app = build_router(state, &HttpConfig::default()).unwrap();
    let addr = serve(app).await;
    Scope {
        base: format!("http://{}", addr),
        store,
        client: reqwest::Client::new(),
    }
}

impl Scope {
    async fn create(&self, body: Value) -> (String, String) {
        let created: Value = self
            .client
            .post(format!("{}/api/mcp/interceptor/create", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(created["success"], true);
        (
            created["id"].as_str().unwrap().to_string(),
            created["proxyUrl"].as_str().unwrap().to_string(),
        )
    }

    async fn logs(&self, id: &str) -> Vec<Value> {
        let body: Value = self
            .client
            .get(format!("{}/api/mcp/interceptor/{}/logs", self.base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        body["logs"].as_array().unwrap().clone()
    }
}

/// Read an SSE body until `needle` shows up and the last event is complete
async fn read_until<S>(body: &mut S, buffer: &mut String, needle: &str)
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !(buffer.contains(needle) && buffer.ends_with("\n\n")) {
        let chunk = tokio::time::timeout_at(deadline, body.next())
            .await
            .expect("timed out waiting for SSE data")
            .expect("stream ended early")
            .unwrap();
        buffer.push_str(&String::from_utf8_lossy(&chunk));
    }
}

fn endpoint_from(buffer: &str) -> String {
    buffer
        .split("\n\n")
        .find(|event| event.contains("event: endpoint"))
        .and_then(|event| event.lines().find_map(|l| l.strip_prefix("data: ")))
        .map(|data| match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(obj)) => obj["url"].as_str().unwrap().to_string(),
            _ => data.to_string(),
        })
        .unwrap()
}

#[tokio::test]
async fn test_json_forwarding_is_logged_and_masked() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(header_is("x-api-key", "injected"))
        .and(header_is("authorization", "Bearer client-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("mcp-session-id", "up-session")
                .set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": {"ok": true}})),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let scope = start_scope().await;
    let (id, proxy_url) = scope
        .create(json!({
            "targetUrl": format!("{}/mcp", upstream.uri()),
            "injectHeaders": {"X-Api-Key": "injected", "Authorization": "Bearer ignored"}
        }))
        .await;
    assert_eq!(proxy_url, format!("{}/proxy/{}", scope.base, id));

    let response = scope
        .client
        .post(&proxy_url)
        .header("authorization", "Bearer client-token")
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.headers()["mcp-session-id"], "up-session");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["ok"], true);

    let logs = scope.logs(&id).await;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0]["direction"], "request");
    assert_eq!(logs[0]["headers"]["authorization"], "Bearer ***");
    assert!(logs[0]["body"].as_str().unwrap().contains("\"ping\""));
    assert_eq!(logs[1]["direction"], "response");
    assert_eq!(logs[1]["status"], 200);
}

#[tokio::test]
async fn test_unreachable_upstream_yields_500() {
    let scope = start_scope().await;
    let (id, proxy_url) = scope
        .create(json!({"targetUrl": "http://127.0.0.1:1/mcp"}))
        .await;

    let response = scope.client.post(&proxy_url).body("{}").send().await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "proxy_upstream_error");

    let entry = scope.store.get(&id).unwrap();
    let last = entry.logs().pop().unwrap();
    match last.payload {
        LogPayload::Response { status, .. } => assert_eq!(status, 500),
        LogPayload::Request { .. } => panic!("expected the failure to be logged"),
    }
}

#[tokio::test]
async fn test_shim_session_relays_responses() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"jsonrpc": "2.0", "id": 7, "result": {"tools": []}})),
        )
        .mount(&upstream)
        .await;

    let scope = start_scope().await;
    let (id, proxy_url) = scope
        .create(json!({"targetUrl": format!("{}/mcp", upstream.uri())}))
        .await;

    let stream = scope
        .client
        .get(&proxy_url)
        .header("accept", "text/event-stream")
        .header("user-agent", "python-httpx/0.27")
        .send()
        .await
        .unwrap();
    assert_eq!(stream.headers()["content-type"], "text/event-stream");
    let mut body = Box::pin(stream.bytes_stream());
    let mut buffer = String::new();
    read_until(&mut body, &mut buffer, "event: endpoint").await;

    assert!(buffer.starts_with("event: ping\n"));
    // string-only clients never see the JSON form
    assert!(!buffer.contains("{\"url\""));

    let endpoint = endpoint_from(&buffer);
    assert!(endpoint.starts_with(&format!("{}/proxy/{}/messages?sessionId=", scope.base, id)));

    let response = scope
        .client
        .post(&endpoint)
        .json(&json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    buffer.clear();
    read_until(&mut body, &mut buffer, "event: message").await;
    assert!(buffer.contains("\"id\":7"));

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].url.path(), "/mcp");
}

// ============================================================================
// Live SSE upstream
// ============================================================================

#[derive(Clone, Default)]
struct LegacyUpstream {
    posted_sessions: Arc<Mutex<Vec<String>>>,
}

async fn legacy_stream() -> Response {
    let frames = stream::iter(vec![
        Ok::<_, Infallible>("event: endpoint\ndata: /messages?sessionId=up-7\n\n".to_string()),
        Ok("event: message\ndata: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/hello\"}\n\n".to_string()),
    ])
    .chain(stream::pending());

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(frames),
    )
        .into_response()
}

async fn legacy_post(
    State(state): State<LegacyUpstream>,
    Query(query): Query<HashMap<String, String>>,
) -> StatusCode {
    if let Some(session) = query.get("sessionId") {
        state.posted_sessions.lock().push(session.clone());
    }
    StatusCode::ACCEPTED
}

#[tokio::test]
async fn test_live_sse_endpoint_is_rewritten() {
    let upstream_state = LegacyUpstream::default();
    let upstream = serve(
        Router::new()
            .route("/sse", get(legacy_stream))
            .route("/messages", post(legacy_post))
            .with_state(upstream_state.clone()),
    )
    .await;

    let scope = start_scope().await;
    let (id, proxy_url) = scope
        .create(json!({"targetUrl": format!("http://{}/sse", upstream)}))
        .await;

    let stream = scope
        .client
        .get(&proxy_url)
        .header("accept", "text/event-stream")
        .send()
        .await
        .unwrap();
    assert_eq!(stream.status(), StatusCode::OK);
    let mut body = Box::pin(stream.bytes_stream());
    let mut buffer = String::new();
    read_until(&mut body, &mut buffer, "notifications/hello").await;

    let endpoint = endpoint_from(&buffer);
    assert_eq!(
        endpoint,
        format!("{}/proxy/{}/messages?sessionId=up-7", scope.base, id)
    );
    assert!(!buffer.contains(&format!("http://{}/messages", upstream)));

    let response = scope
        .client
        .post(&endpoint)
        .json(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(upstream_state.posted_sessions.lock().clone(), vec!["up-7".to_string()]);

    // The mirrored message event shows up in the log as a response
    let logs = scope.logs(&id).await;
    assert!(logs.iter().any(|log| {
        log["direction"] == "response"
            && log["body"]
                .as_str()
                .is_some_and(|b| b.contains("notifications/hello"))
    }));

    drop(body);
    let response = scope
        .client
        .delete(format!("{}/api/mcp/interceptor/{}", scope.base, id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_log_stream_delivers_live_entries() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&upstream)
        .await;

    let scope = start_scope().await;
    let (id, proxy_url) = scope
        .create(json!({"targetUrl": upstream.uri()}))
        .await;

    let logs = scope
        .client
        .get(format!("{}/api/mcp/interceptor/{}/stream", scope.base, id))
        .send()
        .await
        .unwrap();
    let mut body = Box::pin(logs.bytes_stream());

    scope.client.post(&proxy_url).body("{}").send().await.unwrap();

    let mut buffer = String::new();
    read_until(&mut body, &mut buffer, "\"direction\":\"response\"").await;
    assert!(buffer.contains("\"type\":\"log\""));
    assert!(buffer.find("\"direction\":\"request\"") < buffer.find("\"direction\":\"response\""));
}
