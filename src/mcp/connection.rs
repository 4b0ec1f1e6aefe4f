//! A live client session with one MCP server
//!
//! The connection owns the transport and a dispatcher task that reads every
//! inbound message. Responses complete the matching pending request,
//! notifications go to the handler registered for their method, and server
//! initiated requests (ping, roots/list, elicitation/create) are answered here.

use super::transport::{self, Inbound, InboundReceiver, Transport};
use crate::config::{ServerConfig, TransportKind};
use crate::constants::{
    CANCEL_NOTICE_TIMEOUT, CLIENT_NAME, JSONRPC_ELICITATION_TIMEOUT, JSONRPC_INTERNAL_ERROR, JSONRPC_METHOD_NOT_FOUND,
    MCP_PROTOCOL_VERSION, METHOD_CANCELLED, METHOD_ELICITATION_CREATE, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_PING, METHOD_ROOTS_LIST, METHOD_TOOLS_CALL,
};
use crate::model::{
    ConnectionStatus, ElicitationRequest, ElicitationResponse, Implementation, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
    ServerCapabilities, ServerNotification, ServerSummary,
};
use crate::{Result, ScopeError, telemetry};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Callback for one notification method
pub type NotificationHandler = Arc<dyn Fn(ServerNotification) + Send + Sync>;

/// Callback answering a server's elicitation request
pub type ElicitationHandler =
    Arc<dyn Fn(ElicitationRequest) -> BoxFuture<'static, Result<ElicitationResponse>> + Send + Sync>;

/// Handlers attached to a server name
///
/// Bindings outlive individual connections so a reconnect keeps them.
#[derive(Default)]
pub struct ServerBindings {
    notifications: RwLock<HashMap<String, NotificationHandler>>,
    elicitation: RwLock<Option<ElicitationHandler>>,
}

impl ServerBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for a notification method
    pub fn set_notification_handler<S: Into<String>>(&self, method: S, handler: NotificationHandler) {
        self.notifications.write().insert(method.into(), handler);
    }

    pub fn notification_handler(&self, method: &str) -> Option<NotificationHandler> {
        self.notifications.read().get(method).cloned()
    }

    pub fn set_elicitation_handler(&self, handler: ElicitationHandler) {
        *self.elicitation.write() = Some(handler);
    }

    pub fn clear_elicitation_handler(&self) {
        *self.elicitation.write() = None;
    }

    pub fn elicitation_handler(&self) -> Option<ElicitationHandler> {
        self.elicitation.read().clone()
    }

    pub fn clear(&self) {
        self.notifications.write().clear();
        self.clear_elicitation_handler();
    }
}

#[derive(Debug)]
struct ConnectionState {
    status: ConnectionStatus,
    capabilities: Option<ServerCapabilities>,
    server_info: Option<Implementation>,
    protocol_version: Option<String>,
    instructions: Option<String>,
    last_error: Option<String>,
}

type PendingMap = DashMap<RequestId, oneshot::Sender<Result<Value>>>;

/// A `tools/call` result plus what became of the elicitations it triggered
#[derive(Debug)]
pub struct ToolCallOutcome {
    pub result: Result<Value>,
    /// An elicitation attributed to this call expired unanswered
    pub elicitation_expired: bool,
}

pub struct ServerConnection {
    server_id: String,
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    state: RwLock<ConnectionState>,
    pending: PendingMap,
    next_id: AtomicI64,
    bindings: Arc<ServerBindings>,
    request_timeout: Duration,
    // in-flight tools/call ids -> an elicitation it triggered expired
    tool_calls: DashMap<RequestId, bool>,
    closing: AtomicBool,
    cancel: CancellationToken,
}

impl ServerConnection {
    /// Open the transport and run the initialize handshake
    pub async fn connect(
        server_id: &str,
        config: ServerConfig,
        bindings: Arc<ServerBindings>,
        request_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = transport::open(server_id, &config, tx).await?;
        let connection = Self::with_transport(server_id, config, transport, rx, bindings, request_timeout);

        if let Err(e) = connection.handshake().await {
            connection.close().await;
            return Err(ScopeError::connection(format!(
                "Handshake with MCP server '{}' failed: {}",
                server_id, e
            )));
        }

        Ok(connection)
    }

    /// Wrap an already open transport and start dispatching its inbound messages
    pub fn with_transport(
        server_id: &str,
        config: ServerConfig,
        transport: Arc<dyn Transport>,
        inbound: InboundReceiver,
        bindings: Arc<ServerBindings>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let connection = Arc::new(Self {
            server_id: server_id.to_string(),
            config,
            transport,
            state: RwLock::new(ConnectionState {
                status: ConnectionStatus::Connecting,
                capabilities: None,
                server_info: None,
                protocol_version: None,
                instructions: None,
                last_error: None,
            }),
            pending: DashMap::new(),
            next_id: AtomicI64::new(1),
            bindings,
            request_timeout,
            tool_calls: DashMap::new(),
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(dispatch_loop(
            Arc::downgrade(&connection),
            inbound,
            connection.cancel.clone(),
        ));

        connection
    }

    async fn handshake(&self) -> Result<()> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "elicitation": {}
            },
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            }
        });

        let result = self.request(METHOD_INITIALIZE, Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        self.notify(METHOD_INITIALIZED, None).await?;
        self.transport.on_initialized(&init.protocol_version).await?;

        tracing::info!(
            server = %self.server_id,
            server_name = %init.server_info.name,
            protocol_version = %init.protocol_version,
            "Connected to MCP server"
        );

        let mut state = self.state.write();
        state.status = ConnectionStatus::Connected;
        state.capabilities = Some(init.capabilities);
        state.server_info = Some(init.server_info);
        state.protocol_version = Some(init.protocol_version);
        state.instructions = init.instructions;
        Ok(())
    }

    /// Send a request using the connection's default timeout
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.request_timeout).await
    }

    /// Send a request and wait for its response
    ///
    /// `timeout` covers delivery as well as the wait for the answer. On
    /// expiry the pending entry is dropped and the server is told via
    /// `notifications/cancelled`; a late response is then ignored.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.exchange(self.next_request_id(), method, params, timeout).await
    }

    /// Invoke a tool, tracking elicitations that expire while it runs
    pub async fn call_tool(&self, params: Value) -> ToolCallOutcome {
        let id = self.next_request_id();
        self.tool_calls.insert(id.clone(), false);
        let result = self
            .exchange(id.clone(), METHOD_TOOLS_CALL, Some(params), self.request_timeout)
            .await;
        let elicitation_expired = self
            .tool_calls
            .remove(&id)
            .map(|(_, expired)| expired)
            .unwrap_or(false);
        ToolCallOutcome {
            result,
            elicitation_expired,
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn exchange(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.cancel.is_cancelled() {
            return Err(self.disconnected_error());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        // close() may have drained the table between the check and the insert
        if self.cancel.is_cancelled() {
            self.pending.remove(&id);
            return Err(self.disconnected_error());
        }

        let started = Instant::now();
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let round_trip = async {
            self.transport
                .send(JsonRpcMessage::Request(request))
                .await
                .inspect_err(|e| {
                    if let ScopeError::Connection(reason) = e {
                        self.on_transport_failed(reason);
                    }
                })?;
            rx.await.unwrap_or_else(|_| {
                Err(ScopeError::connection(format!(
                    "Connection to '{}' closed while waiting for '{}'",
                    self.server_id, method
                )))
            })
        };

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(self.disconnected_error()),
            result = tokio::time::timeout(timeout, round_trip) => match result {
                Ok(result) => result,
                Err(_) => {
                    self.pending.remove(&id);
                    self.send_cancellation(&id).await;
                    Err(ScopeError::timeout(method, timeout.as_millis() as u64))
                }
            },
        };
        if outcome.is_err() {
            self.pending.remove(&id);
        }

        let label = match &outcome {
            Ok(_) => "ok",
            Err(ScopeError::Timeout { .. }) => "timeout",
            Err(_) => "error",
        };
        telemetry::record_mcp_request(method, label, started.elapsed());
        outcome
    }

    async fn send_cancellation(&self, id: &RequestId) {
        let params = json!({"requestId": id, "reason": "request timed out"});
        let notice = JsonRpcMessage::Notification(JsonRpcNotification::new(METHOD_CANCELLED, Some(params)));
        match tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, self.transport.send(notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(server = %self.server_id, "Failed to send cancellation: {}", e);
            }
            Err(_) => {
                tracing::debug!(server = %self.server_id, "Cancellation for request {} not delivered in time", id);
            }
        }
    }

    /// Send a notification (no response expected)
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(method, params));
        tokio::time::timeout(self.request_timeout, self.transport.send(message))
            .await
            .map_err(|_| ScopeError::timeout(method, self.request_timeout.as_millis() as u64))?
    }

    /// Tear down the transport and fail every in-flight request
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.transport.close().await;
        self.fail_pending(|| self.disconnected_error());
        self.state.write().status = ConnectionStatus::Disconnected;
        tracing::debug!(server = %self.server_id, "Closed MCP connection");
    }

    fn disconnected_error(&self) -> ScopeError {
        ScopeError::connection(format!("MCP server '{}' was disconnected", self.server_id))
    }

    fn fail_pending<F: Fn() -> ScopeError>(&self, make_error: F) {
        let ids: Vec<RequestId> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(make_error()));
            }
        }
    }

    fn on_transport_closed(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!(server = %self.server_id, "MCP server connection closed unexpectedly");
        self.mark_error("connection closed by server");
        self.fail_pending(|| {
            ScopeError::connection(format!("MCP server '{}' closed the connection", self.server_id))
        });
    }

    /// A request could not be delivered; the connection is no longer usable
    fn on_transport_failed(&self, reason: &str) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        tracing::warn!(server = %self.server_id, "MCP transport failed: {}", reason);
        self.mark_error(reason);
    }

    fn mark_error(&self, reason: &str) {
        let mut state = self.state.write();
        state.status = ConnectionStatus::Error;
        state.last_error = Some(reason.to_string());
    }

    fn handle_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Message { message, related } => self.handle_message(message, related),
            Inbound::Unanswered { request, error } => {
                if let Some((_, tx)) = self.pending.remove(&request) {
                    self.on_transport_failed(&error);
                    let _ = tx.send(Err(ScopeError::connection(error)));
                }
            }
        }
    }

    fn handle_message(self: &Arc<Self>, message: JsonRpcMessage, related: Option<RequestId>) {
        match message {
            JsonRpcMessage::Response(response) => match self.pending.remove(&response.id) {
                Some((_, tx)) => {
                    let _ = tx.send(response.into_result());
                }
                None => {
                    tracing::debug!(
                        server = %self.server_id,
                        id = %response.id,
                        "Dropping response for unknown or expired request"
                    );
                }
            },
            JsonRpcMessage::Notification(notification) => {
                match self.bindings.notification_handler(&notification.method) {
                    Some(handler) => handler(ServerNotification {
                        server_id: self.server_id.clone(),
                        method: notification.method,
                        params: notification.params.unwrap_or(Value::Null),
                    }),
                    None => {
                        tracing::trace!(
                            server = %self.server_id,
                            method = %notification.method,
                            "No handler for notification"
                        );
                    }
                }
            }
            JsonRpcMessage::Request(request) => self.handle_server_request(request, related),
        }
    }

    fn handle_server_request(self: &Arc<Self>, request: JsonRpcRequest, related: Option<RequestId>) {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let method = request.method.clone();
            let response = match method.as_str() {
                METHOD_PING => JsonRpcResponse::success(request.id, json!({})),
                METHOD_ROOTS_LIST => JsonRpcResponse::success(request.id, json!({"roots": []})),
                METHOD_ELICITATION_CREATE => connection.answer_elicitation(request, related).await,
                other => {
                    tracing::debug!(server = %connection.server_id, method = other, "Unsupported server request");
                    JsonRpcResponse::failure(
                        request.id,
                        JSONRPC_METHOD_NOT_FOUND,
                        format!("Method not found: {}", other),
                    )
                }
            };

            if let Err(e) = connection.transport.send(JsonRpcMessage::Response(response)).await {
                tracing::warn!(server = %connection.server_id, "Failed to answer server request: {}", e);
            }
        });
    }

    async fn answer_elicitation(&self, request: JsonRpcRequest, related: Option<RequestId>) -> JsonRpcResponse {
        let params = request.params.unwrap_or(Value::Null);
        let elicitation = ElicitationRequest {
            request_id: Uuid::new_v4().to_string(),
            server_id: self.server_id.clone(),
            message: params
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            requested_schema: params
                .get("requestedSchema")
                .cloned()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        };

        let Some(handler) = self.bindings.elicitation_handler() else {
            tracing::info!(server = %self.server_id, "No elicitation handler registered, declining");
            return JsonRpcResponse::success(request.id, elicitation_result(ElicitationResponse::decline()));
        };

        match handler(elicitation).await {
            Ok(answer) => JsonRpcResponse::success(request.id, elicitation_result(answer)),
            Err(ScopeError::ElicitationTimeout(message)) => {
                // Recorded before the server sees the error so the tool call
                // it fails can tell the difference
                match self.attribute_elicitation_timeout(related.as_ref()) {
                    Some(call) => {
                        tracing::debug!(server = %self.server_id, call = %call, "Elicitation expired during tool call");
                    }
                    None => {
                        tracing::debug!(server = %self.server_id, "Expired elicitation not tied to a single tool call");
                    }
                }
                JsonRpcResponse::failure(
                    request.id,
                    JSONRPC_ELICITATION_TIMEOUT,
                    format!("Elicitation timed out: {}", message),
                )
            }
            Err(e) => JsonRpcResponse::failure(request.id, JSONRPC_INTERNAL_ERROR, e.to_string()),
        }
    }

    /// Mark the in-flight `tools/call` an expired elicitation belongs to
    ///
    /// The call whose reply stream carried the elicitation wins; failing
    /// that, the only tool call in flight. Otherwise no call is marked.
    fn attribute_elicitation_timeout(&self, related: Option<&RequestId>) -> Option<RequestId> {
        let target = match related {
            Some(id) if self.tool_calls.contains_key(id) => Some(id.clone()),
            _ => {
                let mut in_flight = self.tool_calls.iter().map(|entry| entry.key().clone());
                match (in_flight.next(), in_flight.next()) {
                    (Some(id), None) => Some(id),
                    _ => None,
                }
            }
        };

        if let Some(ref id) = target
            && let Some(mut expired) = self.tool_calls.get_mut(id)
        {
            *expired = true;
        }
        target
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.read().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.state.read().capabilities.clone()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.state.read().server_info.clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.state.read().protocol_version.clone()
    }

    pub fn instructions(&self) -> Option<String> {
        self.state.read().instructions.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.transport.session_id()
    }

    pub fn summary(&self) -> ServerSummary {
        let state = self.state.read();
        ServerSummary {
            id: self.server_id.clone(),
            transport: self.transport.kind(),
            status: state.status,
            session_id: self.transport.session_id(),
            last_error: state.last_error.clone(),
            server_info: state.server_info.clone(),
            capabilities: state.capabilities.clone(),
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn elicitation_result(response: ElicitationResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|_| json!({"action": "decline"}))
}

async fn dispatch_loop(
    connection: Weak<ServerConnection>,
    mut inbound: InboundReceiver,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbound.recv() => message,
        };

        let Some(connection) = connection.upgrade() else {
            break;
        };
        match message {
            Some(inbound) => connection.handle_inbound(inbound),
            None => {
                connection.on_transport_closed();
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod connection_test;
