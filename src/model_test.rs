use super::*;
use serde_json::json;

#[test]
fn test_jsonrpc_request_serialization() {
    let request = JsonRpcRequest::new(
        RequestId::Number(1),
        "initialize",
        Some(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "mcpscope", "version": "0.1.0"}
        })),
    );

    let serialized = serde_json::to_string(&request).unwrap();
    assert!(serialized.contains(r#""jsonrpc":"2.0""#));
    assert!(serialized.contains(r#""id":1"#));
    assert!(serialized.contains(r#""method":"initialize""#));
}

#[test]
fn test_message_classification() {
    let request: JsonRpcMessage =
        serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc","method":"ping"}"#).unwrap();
    assert!(matches!(request, JsonRpcMessage::Request(ref r) if r.id == RequestId::String("abc".into())));

    let notification: JsonRpcMessage = serde_json::from_str(
        r#"{"jsonrpc":"2.0","method":"notifications/resources/list_changed"}"#,
    )
    .unwrap();
    assert!(matches!(notification, JsonRpcMessage::Notification(_)));

    let response: JsonRpcMessage =
        serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#).unwrap();
    assert!(matches!(response, JsonRpcMessage::Response(ref r) if r.id == RequestId::Number(7)));
}

#[test]
fn test_notification_has_no_id() {
    let notification = JsonRpcNotification::new("notifications/initialized", None);
    let serialized = serde_json::to_string(&notification).unwrap();
    assert!(!serialized.contains(r#""id""#));
    assert!(!serialized.contains("params"));
}

#[test]
fn test_response_error_maps_to_protocol_error() {
    let response: JsonRpcResponse = serde_json::from_str(
        r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#,
    )
    .unwrap();

    match response.into_result() {
        Err(ScopeError::Protocol { code, message, .. }) => {
            assert_eq!(code, -32601);
            assert_eq!(message, "Method not found");
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[test]
fn test_parse_batch() {
    let batch = JsonRpcMessage::parse_batch(json!([
        {"jsonrpc":"2.0","id":1,"result":{}},
        {"jsonrpc":"2.0","method":"notifications/tools/list_changed"}
    ]))
    .unwrap();
    assert_eq!(batch.len(), 2);

    let single = JsonRpcMessage::parse_batch(json!({"jsonrpc":"2.0","id":2,"result":{}})).unwrap();
    assert_eq!(single.len(), 1);
}

#[test]
fn test_initialize_result_capabilities() {
    let result: InitializeResult = serde_json::from_value(json!({
        "protocolVersion": "2025-06-18",
        "capabilities": {
            "logging": {},
            "prompts": {"listChanged": true},
            "resources": {"subscribe": true, "listChanged": true},
            "tools": {"listChanged": true}
        },
        "serverInfo": {"name": "example-server", "version": "1.0.0"}
    }))
    .unwrap();

    assert!(result.capabilities.supports_resource_subscribe());
    assert_eq!(result.server_info.name, "example-server");
}

#[test]
fn test_call_tool_result_normalization() {
    let result: CallToolResult = serde_json::from_value(json!({
        "content": [
            {"type": "text", "text": "3"},
            {"type": "image", "data": "aGk=", "mimeType": "image/png"}
        ],
        "structuredContent": {"sum": 3}
    }))
    .unwrap();

    assert!(!result.is_error);
    assert_eq!(result.first_text(), Some("3"));
    assert_eq!(result.structured_content, Some(json!({"sum": 3})));
    assert_eq!(result.content.len(), 2);

    let value = serde_json::to_value(&result).unwrap();
    assert_eq!(value["isError"], false);
    assert_eq!(value["content"][1]["mimeType"], "image/png");
}

#[test]
fn test_call_tool_result_legacy_shape() {
    let result: CallToolResult =
        serde_json::from_value(json!({"toolResult": {"answer": 42}})).unwrap();
    assert_eq!(result.content.len(), 1);
    assert_eq!(result.structured_content, Some(json!({"answer": 42})));
}

#[test]
fn test_call_tool_result_is_error_becomes_tool_execution_error() {
    let result: CallToolResult = serde_json::from_value(json!({
        "content": [{"type": "text", "text": "division by zero"}],
        "isError": true
    }))
    .unwrap();

    match result.into_result() {
        Err(ScopeError::ToolExecution(msg)) => assert_eq!(msg, "division by zero"),
        other => panic!("expected tool execution error, got {:?}", other),
    }
}

#[test]
fn test_elicitation_response_wire_format() {
    let accept = ElicitationResponse::accept(json!({"confirmed": true}));
    assert_eq!(
        serde_json::to_value(&accept).unwrap(),
        json!({"action": "accept", "content": {"confirmed": true}})
    );
    assert_eq!(
        serde_json::to_value(ElicitationResponse::decline()).unwrap(),
        json!({"action": "decline"})
    );
}

#[test]
fn test_server_tool_flattens_tool() {
    let tool: Tool = serde_json::from_value(json!({
        "name": "add",
        "description": "Add two numbers",
        "inputSchema": {"type": "object"}
    }))
    .unwrap();
    let value = serde_json::to_value(ServerTool {
        server_id: "math".to_string(),
        tool,
    })
    .unwrap();
    assert_eq!(value["serverId"], "math");
    assert_eq!(value["name"], "add");
}
