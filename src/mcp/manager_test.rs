use super::*;
use serde_json::json;

fn missing_binary() -> ServerConfig {
    ServerConfig::stdio("mcpscope-definitely-not-a-real-binary", vec![])
}

#[tokio::test]
async fn test_failed_connect_keeps_name_with_error_status() {
    let manager = McpManager::default();

    let err = manager
        .connect_to_server("broken", missing_binary())
        .await
        .err().unwrap();
    assert!(matches!(err, ScopeError::Connection(_)));

    assert!(manager.has_server("broken"));
    assert_eq!(manager.server_status("broken"), Some(ConnectionStatus::Error));

    let servers = manager.list_servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, "broken");
    assert_eq!(servers[0].status, ConnectionStatus::Error);
    assert!(servers[0].last_error.as_deref().unwrap().contains("spawn"));

    assert!(manager.get_client("broken").is_none());
    assert!(matches!(
        manager.connection("broken"),
        Err(ScopeError::Connection(_))
    ));
}

#[tokio::test]
async fn test_unknown_server_is_not_found() {
    let manager = McpManager::default();

    assert!(matches!(
        manager.disconnect_server("ghost").await,
        Err(ScopeError::NotFound(_))
    ));
    assert!(matches!(
        manager.connection("ghost"),
        Err(ScopeError::NotFound(_))
    ));
    assert!(!manager.has_server("ghost"));
    assert!(manager.get_session_id_by_server("ghost").is_none());
}

#[tokio::test]
async fn test_empty_name_rejected() {
    let manager = McpManager::default();
    assert!(matches!(
        manager.connect_to_server("  ", missing_binary()).await,
        Err(ScopeError::Validation(_))
    ));
}

#[tokio::test]
async fn test_disconnect_forgets_name_and_handlers() {
    let manager = McpManager::default();
    let _ = manager.connect_to_server("broken", missing_binary()).await;
    manager.on_resource_updated("broken", |_| {});
    assert!(
        manager
            .bindings_for("broken")
            .notification_handler(NOTIFICATION_RESOURCE_UPDATED)
            .is_some()
    );

    manager.disconnect_server("broken").await.unwrap();
    assert!(!manager.has_server("broken"));
    assert!(manager.list_servers().is_empty());
    assert!(
        manager
            .bindings_for("broken")
            .notification_handler(NOTIFICATION_RESOURCE_UPDATED)
            .is_none()
    );

    // Second disconnect has nothing to act on
    assert!(matches!(
        manager.disconnect_server("broken").await,
        Err(ScopeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_handlers_can_be_registered_before_connect() {
    let manager = McpManager::default();
    manager.on_prompt_list_changed("later", |_| {});
    manager.set_elicitation_handler("later", |_request| async {
        Ok(ElicitationResponse::decline())
    });

    let bindings = manager.bindings_for("later");
    assert!(
        bindings
            .notification_handler(NOTIFICATION_PROMPT_LIST_CHANGED)
            .is_some()
    );
    assert!(bindings.elicitation_handler().is_some());

    manager.clear_elicitation_handler("later");
    assert!(bindings.elicitation_handler().is_none());
}

#[tokio::test]
async fn test_pending_elicitation_handler_parks_requests() {
    let manager = McpManager::new(ManagerOptions {
        request_timeout: Duration::from_secs(5),
        elicitation_timeout: Duration::from_secs(5),
    });
    let announced = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let announced = announced.clone();
        manager.set_pending_elicitation_handler("demo", move |request| {
            announced.lock().push(request.request_id.clone());
        });
    }

    let handler = manager.bindings_for("demo").elicitation_handler().unwrap();
    let answer = tokio::spawn(handler(ElicitationRequest {
        request_id: "e-1".to_string(),
        server_id: "demo".to_string(),
        message: "Continue?".to_string(),
        requested_schema: json!({"type": "object"}),
    }));

    for _ in 0..100 {
        if manager.pending_elicitations().contains("e-1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(announced.lock().as_slice(), ["e-1".to_string()]);
    assert_eq!(manager.list_pending_elicitations().len(), 1);

    manager
        .respond_to_elicitation("e-1", ElicitationResponse::accept(json!({"ok": true})))
        .unwrap();
    let response = answer.await.unwrap().unwrap();
    assert_eq!(response.content, Some(json!({"ok": true})));

    assert!(matches!(
        manager.respond_to_elicitation("e-1", ElicitationResponse::decline()),
        Err(ScopeError::NotFound(_))
    ));
}

#[test]
fn test_options_from_limits() {
    let limits = LimitsConfig {
        request_timeout_ms: 1500,
        elicitation_timeout_ms: 2500,
        max_log_entries: 10,
    };
    let options = ManagerOptions::from(&limits);
    assert_eq!(options.request_timeout, Duration::from_millis(1500));
    assert_eq!(options.elicitation_timeout, Duration::from_millis(2500));
}
