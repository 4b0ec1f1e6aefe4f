//! mcpscope demo server - a small stdio MCP server
//!
//! Tools: `add`, `echo`, `sleep`, `confirm` (asks the client via
//! elicitation), `fail` (always reports `isError`), `touch` (emits
//! list-changed and resource-updated notifications). One resource, one
//! resource template, one prompt.
//!
//! Run with: cargo run --bin mcpscope-demo-server

use mcpscope::constants::{JSONRPC_VERSION, MCP_PROTOCOL_VERSION};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};

const SERVER_NAME: &str = "mcpscope-demo-server";
const GREETING_URI: &str = "demo://greeting";
const GREETING_TEMPLATE: &str = "demo://greeting/{name}";
/// Tools returned per `tools/list` page
const TOOLS_PAGE_SIZE: usize = 4;

type Outbound = mpsc::UnboundedSender<Value>;

struct Server {
    outbound: Outbound,
    next_id: AtomicI64,
    /// Requests we sent to the client, waiting for its answer
    waiting: Mutex<HashMap<i64, oneshot::Sender<Value>>>,
    subscriptions: Mutex<HashSet<String>>,
}

impl Server {
    fn send(&self, message: Value) {
        let _ = self.outbound.send(message);
    }

    fn notify(&self, method: &str, params: Value) {
        self.send(json!({ "jsonrpc": JSONRPC_VERSION, "method": method, "params": params }));
    }

    /// Send a request to the client and wait for the raw response object
    async fn ask(&self, method: &str, params: Value) -> Option<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(id, tx);
        self.send(json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "method": method, "params": params }));
        rx.await.ok()
    }

    async fn resolve(&self, response: Value) {
        let Some(id) = response.get("id").and_then(Value::as_i64) else {
            return;
        };
        if let Some(tx) = self.waiting.lock().await.remove(&id) {
            let _ = tx.send(response);
        }
    }
}

fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": { "a": { "type": "number" }, "b": { "type": "number" } },
                "required": ["a", "b"]
            }
        }),
        json!({
            "name": "echo",
            "description": "Echo the given text",
            "inputSchema": {
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }
        }),
        json!({
            "name": "sleep",
            "description": "Wait for the given number of milliseconds",
            "inputSchema": {
                "type": "object",
                "properties": { "ms": { "type": "integer" } }
            }
        }),
        json!({
            "name": "confirm",
            "description": "Ask the user to confirm before answering",
            "inputSchema": {
                "type": "object",
                "properties": { "message": { "type": "string" } }
            }
        }),
        json!({
            "name": "fail",
            "description": "Always reports a tool error, optionally after a delay",
            "inputSchema": {
                "type": "object",
                "properties": { "delayMs": { "type": "integer" } }
            }
        }),
        json!({
            "name": "touch",
            "description": "Emit list-changed and resource-updated notifications",
            "inputSchema": { "type": "object" }
        }),
    ]
}

fn text_result(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": is_error
    })
}

async fn call_tool(server: &Server, params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "add" => {
            let a = args.get("a").and_then(Value::as_f64).unwrap_or(0.0);
            let b = args.get("b").and_then(Value::as_f64).unwrap_or(0.0);
            let sum = a + b;
            let text = if sum.fract() == 0.0 {
                format!("{}", sum as i64)
            } else {
                sum.to_string()
            };
            let mut result = text_result(text, false);
            result["structuredContent"] = json!({ "sum": sum });
            Ok(result)
        }
        "echo" => {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(text_result(text, false))
        }
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(text_result(format!("slept {} ms", ms), false))
        }
        "confirm" => {
            let message = args
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Proceed?");
            let params = json!({
                "message": message,
                "requestedSchema": {
                    "type": "object",
                    "properties": { "confirmed": { "type": "boolean" } },
                    "required": ["confirmed"]
                }
            });
            let Some(response) = server.ask("elicitation/create", params).await else {
                return Ok(text_result("elicitation abandoned", true));
            };
            if let Some(error) = response.get("error") {
                let reason = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Ok(text_result(format!("elicitation failed: {}", reason), true));
            }
            let result = response.get("result").cloned().unwrap_or(Value::Null);
            match result.get("action").and_then(Value::as_str) {
                Some("accept") => {
                    let content = result.get("content").cloned().unwrap_or(Value::Null);
                    Ok(text_result(format!("confirmed: {}", content), false))
                }
                Some(action) => Ok(text_result(format!("user chose {}", action), false)),
                None => Ok(text_result("malformed elicitation response", true)),
            }
        }
        "fail" => {
            if let Some(ms) = args.get("delayMs").and_then(Value::as_u64) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(text_result("this tool always fails", true))
        }
        "touch" => {
            server.notify("notifications/tools/list_changed", json!({}));
            server.notify("notifications/resources/list_changed", json!({}));
            for uri in server.subscriptions.lock().await.iter() {
                server.notify("notifications/resources/updated", json!({ "uri": uri }));
            }
            Ok(text_result("touched", false))
        }
        other => Err((-32602, format!("Unknown tool: {}", other))),
    }
}

fn read_resource(uri: &str) -> Result<Value, (i64, String)> {
    let text = if uri == GREETING_URI {
        "Hello from the mcpscope demo server".to_string()
    } else if let Some(name) = uri.strip_prefix("demo://greeting/") {
        format!("Hello, {}!", name)
    } else {
        return Err((-32002, format!("Resource not found: {}", uri)));
    };
    Ok(json!({
        "contents": [{ "uri": uri, "mimeType": "text/plain", "text": text }]
    }))
}

async fn handle_request(server: &Server, method: &str, params: Value) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": params
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(MCP_PROTOCOL_VERSION),
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "subscribe": true, "listChanged": true },
                "prompts": { "listChanged": false }
            },
            "serverInfo": { "name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION") },
            "instructions": "Demo server for trying mcpscope"
        })),
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools = tool_definitions();
            let offset: usize = params
                .get("cursor")
                .and_then(Value::as_str)
                .and_then(|c| c.parse().ok())
                .unwrap_or(0);
            let end = (offset + TOOLS_PAGE_SIZE).min(tools.len());
            let page: Vec<Value> = tools.get(offset..end).map(<[Value]>::to_vec).unwrap_or_default();
            let mut result = json!({ "tools": page });
            if end < tools.len() {
                result["nextCursor"] = json!(end.to_string());
            }
            Ok(result)
        }
        "tools/call" => call_tool(server, &params).await,
        "resources/list" => Ok(json!({
            "resources": [{
                "uri": GREETING_URI,
                "name": "greeting",
                "mimeType": "text/plain"
            }]
        })),
        "resources/templates/list" => Ok(json!({
            "resourceTemplates": [{
                "uriTemplate": GREETING_TEMPLATE,
                "name": "personal greeting",
                "mimeType": "text/plain"
            }]
        })),
        "resources/read" => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            read_resource(uri)
        }
        "resources/subscribe" | "resources/unsubscribe" => {
            let uri = params
                .get("uri")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut subscriptions = server.subscriptions.lock().await;
            if method == "resources/subscribe" {
                subscriptions.insert(uri);
            } else {
                subscriptions.remove(&uri);
            }
            Ok(json!({}))
        }
        "prompts/list" => Ok(json!({
            "prompts": [{
                "name": "greet",
                "description": "Greet someone by name",
                "arguments": [{ "name": "name", "required": true }]
            }]
        })),
        "prompts/get" => {
            let name = params
                .pointer("/arguments/name")
                .and_then(Value::as_str)
                .unwrap_or("stranger");
            Ok(json!({
                "description": "A greeting",
                "messages": [{
                    "role": "user",
                    "content": { "type": "text", "text": format!("Please greet {}", name) }
                }]
            }))
        }
        other => Err((-32601, format!("Method not found: {}", other))),
    }
}

async fn dispatch(server: Arc<Server>, message: Value) {
    let method = message.get("method").and_then(Value::as_str).map(String::from);
    let id = message.get("id").cloned();

    match (method, id) {
        (Some(method), Some(id)) => {
            let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
            let response = match handle_request(&server, &method, params).await {
                Ok(result) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result }),
                Err((code, msg)) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": id,
                    "error": { "code": code, "message": msg }
                }),
            };
            server.send(response);
        }
        // notifications (initialized, cancelled) need no answer
        (Some(_), None) => {}
        (None, Some(_)) => server.resolve(message).await,
        (None, None) => {}
    }
}

#[tokio::main]
async fn main() {
    mcpscope::init_logging(Some("warn"));

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
    let server = Arc::new(Server {
        outbound,
        next_id: AtomicI64::new(1),
        waiting: Mutex::new(HashMap::new()),
        subscriptions: Mutex::new(HashSet::new()),
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = outbound_rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(message) => {
                tokio::spawn(dispatch(server.clone(), message));
            }
            Err(e) => tracing::warn!("Ignoring malformed input: {}", e),
        }
    }

    drop(server);
    writer.abort();
}
