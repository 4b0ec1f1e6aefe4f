//! Server management and tool/resource/prompt endpoints

use super::{AppError, AppState};
use crate::config::ServerConfig;
use crate::model::{
    CallToolResult, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, ReadResourceResult, ServerSummary,
};
use crate::ScopeError;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

type HandlerResult<T> = std::result::Result<T, AppError>;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/mcp/servers", get(list_servers))
        .route("/api/mcp/servers/{name}", delete(disconnect_server))
        .route("/api/mcp/servers/{name}/connect", post(connect_server))
        .route("/api/mcp/servers/{name}/tools", get(list_tools))
        .route("/api/mcp/servers/{name}/tools/call", post(call_tool))
        .route("/api/mcp/servers/{name}/resources", get(list_resources))
        .route(
            "/api/mcp/servers/{name}/resources/templates",
            get(list_resource_templates),
        )
        .route("/api/mcp/servers/{name}/resources/read", post(read_resource))
        .route(
            "/api/mcp/servers/{name}/resources/subscribe",
            post(subscribe_resource),
        )
        .route(
            "/api/mcp/servers/{name}/resources/unsubscribe",
            post(unsubscribe_resource),
        )
        .route("/api/mcp/servers/{name}/prompts", get(list_prompts))
        .route("/api/mcp/servers/{name}/prompts/get", post(get_prompt))
        .route("/api/mcp/tools", get(all_tools))
}

#[derive(Debug, Default, Deserialize)]
pub struct CursorQuery {
    pub cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallToolRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Deserialize)]
pub struct UriRequest {
    pub uri: String,
}

#[derive(Debug, Deserialize)]
pub struct GetPromptRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ToolsQuery {
    /// Comma-separated server names; all connected servers when absent
    pub servers: Option<String>,
}

async fn list_servers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "servers": state.manager.list_servers() }))
}

async fn connect_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<ServerConfig>,
) -> HandlerResult<Json<ServerSummary>> {
    state.connect_server(&name, config).await?;
    let summary = state
        .manager
        .list_servers()
        .into_iter()
        .find(|s| s.id == name)
        .ok_or_else(|| ScopeError::not_found(format!("MCP server '{}' not found", name)))?;
    Ok(Json(summary))
}

/// Disconnecting also tears down the server's interceptor entries
async fn disconnect_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> HandlerResult<Json<Value>> {
    state.manager.disconnect_server(&name).await?;
    let removed = state.store.destroy_by_server(&name);
    Ok(Json(json!({ "success": true, "interceptorsRemoved": removed })))
}

async fn list_tools(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<CursorQuery>,
) -> HandlerResult<Json<ListToolsResult>> {
    Ok(Json(
        state
            .manager
            .list_tools(&name, query.cursor.as_deref())
            .await?,
    ))
}

async fn all_tools(
    State(state): State<AppState>,
    Query(query): Query<ToolsQuery>,
) -> HandlerResult<Json<Value>> {
    let servers: Option<Vec<String>> = query.servers.map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    });
    let tools = state.manager.get_tools(servers.as_deref()).await?;
    Ok(Json(json!({ "tools": tools })))
}

async fn call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<CallToolRequest>,
) -> HandlerResult<Json<CallToolResult>> {
    let result = state
        .manager
        .execute_tool(&name, &request.name, request.arguments)
        .await?;
    Ok(Json(result))
}

async fn list_resources(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<CursorQuery>,
) -> HandlerResult<Json<ListResourcesResult>> {
    Ok(Json(
        state
            .manager
            .list_resources(&name, query.cursor.as_deref())
            .await?,
    ))
}

async fn list_resource_templates(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<CursorQuery>,
) -> HandlerResult<Json<ListResourceTemplatesResult>> {
    Ok(Json(
        state
            .manager
            .list_resource_templates(&name, query.cursor.as_deref())
            .await?,
    ))
}

async fn read_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UriRequest>,
) -> HandlerResult<Json<ReadResourceResult>> {
    Ok(Json(state.manager.read_resource(&name, &request.uri).await?))
}

async fn subscribe_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UriRequest>,
) -> HandlerResult<Json<Value>> {
    state.manager.subscribe_resource(&name, &request.uri).await?;
    Ok(Json(json!({ "success": true })))
}

async fn unsubscribe_resource(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<UriRequest>,
) -> HandlerResult<Json<Value>> {
    state
        .manager
        .unsubscribe_resource(&name, &request.uri)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn list_prompts(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<CursorQuery>,
) -> HandlerResult<Json<ListPromptsResult>> {
    Ok(Json(
        state
            .manager
            .list_prompts(&name, query.cursor.as_deref())
            .await?,
    ))
}

async fn get_prompt(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<GetPromptRequest>,
) -> HandlerResult<Json<GetPromptResult>> {
    Ok(Json(
        state
            .manager
            .get_prompt(&name, &request.name, request.arguments)
            .await?,
    ))
}
