//! MCP Manager - owns every named server connection
//!
//! Lifecycle operations on one server name are serialized through a per-name
//! slot lock, so a reconnect always finishes tearing down the old transport
//! before the new one is opened. Different names never block each other.

use super::connection::{ElicitationHandler, NotificationHandler, ServerBindings, ServerConnection};
use super::elicitation::{PendingElicitationInfo, PendingElicitations};
use crate::config::{LimitsConfig, ServerConfig};
use crate::constants::{
    DEFAULT_ELICITATION_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS, NOTIFICATION_PROMPT_LIST_CHANGED,
    NOTIFICATION_RESOURCE_LIST_CHANGED, NOTIFICATION_RESOURCE_UPDATED,
    NOTIFICATION_TOOL_LIST_CHANGED,
};
use crate::model::{ConnectionStatus, ElicitationRequest, ElicitationResponse, ServerNotification, ServerSummary};
use crate::{Result, ScopeError};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Timeouts applied to connections the manager creates
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub request_timeout: Duration,
    pub elicitation_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            elicitation_timeout: Duration::from_millis(DEFAULT_ELICITATION_TIMEOUT_MS),
        }
    }
}

impl From<&LimitsConfig> for ManagerOptions {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            request_timeout: limits.request_timeout(),
            elicitation_timeout: limits.elicitation_timeout(),
        }
    }
}

struct SlotState {
    config: Option<ServerConfig>,
    connection: Option<Arc<ServerConnection>>,
    status: ConnectionStatus,
    last_error: Option<String>,
    /// Set once the slot has been disconnected and taken out of the map
    removed: bool,
}

struct ServerSlot {
    op_lock: tokio::sync::Mutex<()>,
    state: RwLock<SlotState>,
}

impl ServerSlot {
    fn new() -> Self {
        Self {
            op_lock: tokio::sync::Mutex::new(()),
            state: RwLock::new(SlotState {
                config: None,
                connection: None,
                status: ConnectionStatus::Disconnected,
                last_error: None,
                removed: false,
            }),
        }
    }

    fn summary(&self, id: &str) -> Option<ServerSummary> {
        let state = self.state.read();
        if let Some(ref connection) = state.connection {
            return Some(connection.summary());
        }
        let config = state.config.as_ref()?;
        Some(ServerSummary {
            id: id.to_string(),
            transport: config.kind(),
            status: state.status,
            session_id: None,
            last_error: state.last_error.clone(),
            server_info: None,
            capabilities: None,
        })
    }
}

/// Multi-server MCP client
pub struct McpManager {
    servers: DashMap<String, Arc<ServerSlot>>,
    bindings: DashMap<String, Arc<ServerBindings>>,
    pending_elicitations: PendingElicitations,
    options: ManagerOptions,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new(ManagerOptions::default())
    }
}

impl McpManager {
    pub fn new(options: ManagerOptions) -> Self {
        Self {
            servers: DashMap::new(),
            bindings: DashMap::new(),
            pending_elicitations: PendingElicitations::new(),
            options,
        }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Connect (or reconnect) a named server
    ///
    /// An existing connection under the same name is closed first. On
    /// failure the name stays registered with status `error` and the error
    /// is returned.
    pub async fn connect_to_server(&self, name: &str, config: ServerConfig) -> Result<Arc<ServerConnection>> {
        if name.trim().is_empty() {
            return Err(ScopeError::validation("server name must not be empty"));
        }

        loop {
            let slot = self
                .servers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServerSlot::new()))
                .clone();
            let _guard = slot.op_lock.lock().await;

            // A concurrent disconnect retired this slot while we waited
            if slot.state.read().removed {
                continue;
            }

            let previous = {
                let mut state = slot.state.write();
                state.config = Some(config.clone());
                state.status = ConnectionStatus::Connecting;
                state.last_error = None;
                state.connection.take()
            };
            if let Some(previous) = previous {
                tracing::info!(server = %name, "Reconnecting MCP server, closing previous connection");
                previous.close().await;
            }

            let timeout = config.timeout().unwrap_or(self.options.request_timeout);
            let result = ServerConnection::connect(name, config.clone(), self.bindings_for(name), timeout).await;

            let mut state = slot.state.write();
            return match result {
                Ok(connection) => {
                    state.status = ConnectionStatus::Connected;
                    state.connection = Some(connection.clone());
                    Ok(connection)
                }
                Err(e) => {
                    tracing::warn!(server = %name, "Failed to connect MCP server: {}", e);
                    state.status = ConnectionStatus::Error;
                    state.last_error = Some(e.to_string());
                    Err(e)
                }
            };
        }
    }

    /// Close a server and forget its name, handlers included
    pub async fn disconnect_server(&self, name: &str) -> Result<()> {
        let slot = self
            .servers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ScopeError::not_found(format!("MCP server '{}' is not registered", name)))?;
        let _guard = slot.op_lock.lock().await;

        let connection = {
            let mut state = slot.state.write();
            if state.removed {
                return Err(ScopeError::not_found(format!(
                    "MCP server '{}' is not registered",
                    name
                )));
            }
            state.removed = true;
            state.status = ConnectionStatus::Disconnected;
            state.connection.take()
        };

        if let Some(connection) = connection {
            connection.close().await;
        }

        self.servers.remove_if(name, |_, current| Arc::ptr_eq(current, &slot));
        if let Some((_, bindings)) = self.bindings.remove(name) {
            bindings.clear();
        }

        tracing::info!(server = %name, "Disconnected MCP server");
        Ok(())
    }

    /// Disconnect every server concurrently
    pub async fn disconnect_all_servers(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        let results = futures::future::join_all(names.iter().map(|name| self.disconnect_server(name))).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result
                && !matches!(e, ScopeError::NotFound(_))
            {
                tracing::warn!(server = %name, "Failed to disconnect MCP server: {}", e);
            }
        }
        self.pending_elicitations.clear();
    }

    /// Summaries of every registered server, sorted by name
    pub fn list_servers(&self) -> Vec<ServerSummary> {
        let mut summaries: Vec<ServerSummary> = self
            .servers
            .iter()
            .filter_map(|entry| entry.value().summary(entry.key()))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn has_server(&self, name: &str) -> bool {
        self.servers
            .get(name)
            .map(|slot| slot.state.read().config.is_some())
            .unwrap_or(false)
    }

    pub fn server_status(&self, name: &str) -> Option<ConnectionStatus> {
        let slot = self.servers.get(name)?;
        let state = slot.state.read();
        state.config.as_ref()?;
        Some(match state.connection {
            Some(ref connection) => connection.status(),
            None => state.status,
        })
    }

    pub fn server_config(&self, name: &str) -> Option<ServerConfig> {
        self.servers.get(name)?.state.read().config.clone()
    }

    /// The live connection for a name, whatever its status
    pub fn get_client(&self, name: &str) -> Option<Arc<ServerConnection>> {
        self.servers.get(name)?.state.read().connection.clone()
    }

    /// The connection for a name, failing unless it is usable
    pub fn connection(&self, name: &str) -> Result<Arc<ServerConnection>> {
        let slot = self
            .servers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ScopeError::not_found(format!("MCP server '{}' is not registered", name)))?;
        let state = slot.state.read();

        match state.connection {
            Some(ref connection) if connection.is_connected() => Ok(connection.clone()),
            Some(ref connection) => Err(ScopeError::connection(format!(
                "MCP server '{}' is {}{}",
                name,
                connection.status(),
                connection
                    .last_error()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ))),
            None => Err(ScopeError::connection(format!(
                "MCP server '{}' is {}{}",
                name,
                state.status,
                state
                    .last_error
                    .as_ref()
                    .map(|e| format!(": {}", e))
                    .unwrap_or_default()
            ))),
        }
    }

    /// Session id an HTTP server assigned to our connection
    pub fn get_session_id_by_server(&self, name: &str) -> Option<String> {
        self.get_client(name)?.session_id()
    }

    fn bindings_for(&self, name: &str) -> Arc<ServerBindings> {
        self.bindings
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ServerBindings::new()))
            .clone()
    }

    /// Register a handler for any notification method on one server
    pub fn add_notification_handler<F>(&self, name: &str, method: &str, handler: F)
    where
        F: Fn(ServerNotification) + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        self.bindings_for(name).set_notification_handler(method, handler);
    }

    pub fn on_resource_list_changed<F>(&self, name: &str, handler: F)
    where
        F: Fn(ServerNotification) + Send + Sync + 'static,
    {
        self.add_notification_handler(name, NOTIFICATION_RESOURCE_LIST_CHANGED, handler);
    }

    pub fn on_resource_updated<F>(&self, name: &str, handler: F)
    where
        F: Fn(ServerNotification) + Send + Sync + 'static,
    {
        self.add_notification_handler(name, NOTIFICATION_RESOURCE_UPDATED, handler);
    }

    pub fn on_prompt_list_changed<F>(&self, name: &str, handler: F)
    where
        F: Fn(ServerNotification) + Send + Sync + 'static,
    {
        self.add_notification_handler(name, NOTIFICATION_PROMPT_LIST_CHANGED, handler);
    }

    pub fn on_tool_list_changed<F>(&self, name: &str, handler: F)
    where
        F: Fn(ServerNotification) + Send + Sync + 'static,
    {
        self.add_notification_handler(name, NOTIFICATION_TOOL_LIST_CHANGED, handler);
    }

    /// Answer a server's elicitation requests with `handler`
    ///
    /// Without a handler, elicitations are declined immediately.
    pub fn set_elicitation_handler<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(ElicitationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ElicitationResponse>> + Send + 'static,
    {
        let handler: ElicitationHandler = Arc::new(move |request| handler(request).boxed());
        self.bindings_for(name).set_elicitation_handler(handler);
    }

    /// Park elicitations from `name` in the pending table until
    /// [`McpManager::respond_to_elicitation`] answers them or they expire
    ///
    /// `on_request` is told about each request as it is parked.
    pub fn set_pending_elicitation_handler<F>(&self, name: &str, on_request: F)
    where
        F: Fn(&ElicitationRequest) + Send + Sync + 'static,
    {
        let pending = self.pending_elicitations.clone();
        let timeout = self.options.elicitation_timeout;
        let on_request = Arc::new(on_request);
        self.set_elicitation_handler(name, move |request: ElicitationRequest| {
            let waiter = pending.register_request(&request, timeout);
            on_request(&request);
            waiter.wait()
        });
    }

    pub fn clear_elicitation_handler(&self, name: &str) {
        if let Some(bindings) = self.bindings.get(name) {
            bindings.clear_elicitation_handler();
        }
    }

    pub fn pending_elicitations(&self) -> &PendingElicitations {
        &self.pending_elicitations
    }

    pub fn list_pending_elicitations(&self) -> Vec<PendingElicitationInfo> {
        self.pending_elicitations.list()
    }

    /// Deliver a user's answer to a parked elicitation
    pub fn respond_to_elicitation(&self, request_id: &str, response: ElicitationResponse) -> Result<()> {
        self.pending_elicitations.respond(request_id, response)
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod manager_test;
