//! Interceptor management API and forwarding endpoints

use super::ProxyState;
use super::forward::forward;
use crate::config::TransportConfig;
use crate::constants::{INTERCEPTOR_API_PREFIX, PROXY_ROUTE_PREFIX, SSE_KEEPALIVE_INTERVAL};
use crate::http::AppError;
use crate::interceptor::{InterceptorInfo, LogSubscription, ProxyLogEntry};
use crate::mcp::transport::build_headers;
use crate::ScopeError;
use axum::{
    Json, Router,
    extract::{FromRef, Path, Request, State},
    http::HeaderMap,
    response::{
        Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{any, delete, get, post},
};
use futures::Stream;
use futures::stream;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;

type HandlerResult<T> = std::result::Result<T, AppError>;

/// Management routes under the interceptor API prefix
pub fn management_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ProxyState: FromRef<S>,
{
    let p = INTERCEPTOR_API_PREFIX;
    Router::new()
        .route(p, get(list_entries))
        .route(&format!("{}/create", p), post(create_entry))
        .route(&format!("{}/by-server/{{server_id}}", p), delete(destroy_by_server))
        .route(&format!("{}/{{id}}", p), get(entry_info).delete(destroy_entry))
        .route(&format!("{}/{{id}}/clear", p), post(clear_logs))
        .route(&format!("{}/{{id}}/logs", p), get(entry_logs))
        .route(&format!("{}/{{id}}/stream", p), get(stream_logs))
}

/// Forwarding endpoints at `/proxy/{id}[/*]` and `<api>/{id}/proxy[/*]`
pub fn forwarding_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ProxyState: FromRef<S>,
{
    Router::new()
        .route(&format!("{}/{{id}}", PROXY_ROUTE_PREFIX), any(proxy_root))
        .route(&format!("{}/{{id}}/{{*path}}", PROXY_ROUTE_PREFIX), any(proxy_path))
        .route(&format!("{}/{{id}}/proxy", INTERCEPTOR_API_PREFIX), any(proxy_root))
        .route(
            &format!("{}/{{id}}/proxy/{{*path}}", INTERCEPTOR_API_PREFIX),
            any(proxy_path),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest {
    target_url: Option<String>,
    server_id: Option<String>,
    inject_headers: Option<HashMap<String, String>>,
}

/// A server-bound entry targets the server's URL and carries its headers
fn resolve_server_target(
    state: &ProxyState,
    server_id: &str,
) -> crate::Result<(String, HashMap<String, String>)> {
    let config = state
        .manager
        .server_config(server_id)
        .ok_or_else(|| ScopeError::not_found(format!("MCP server '{}' not found", server_id)))?;

    match config.transport {
        TransportConfig::Http(http) => {
            let headers = build_headers(&http)?
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            Ok((http.url.to_string(), headers))
        }
        TransportConfig::Stdio(_) => Err(ScopeError::validation(format!(
            "MCP server '{}' uses the stdio transport and cannot be proxied",
            server_id
        ))),
    }
}

async fn create_entry(
    State(state): State<ProxyState>,
    headers: HeaderMap,
    Json(request): Json<CreateRequest>,
) -> HandlerResult<Json<Value>> {
    let (target_url, mut inject) = match (request.target_url, request.server_id.as_deref()) {
        (Some(url), _) => (url, HashMap::new()),
        (None, Some(server_id)) => resolve_server_target(&state, server_id)?,
        (None, None) => {
            return Err(ScopeError::validation("either targetUrl or serverId is required").into());
        }
    };
    // explicit inject headers win over the server's configured ones
    inject.extend(request.inject_headers.unwrap_or_default());

    let entry = state
        .store
        .create(&target_url, Some(inject), request.server_id)?;
    let proxy_url = format!(
        "{}{}/{}",
        state.public_base(&headers),
        PROXY_ROUTE_PREFIX,
        entry.id()
    );

    Ok(Json(json!({
        "success": true,
        "id": entry.id(),
        "proxyUrl": proxy_url,
        "targetUrl": entry.target_url().as_str(),
    })))
}

async fn list_entries(State(state): State<ProxyState>) -> Json<Value> {
    Json(json!({ "interceptors": state.store.list() }))
}

async fn entry_info(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> HandlerResult<Json<InterceptorInfo>> {
    Ok(Json(state.store.info(&id)?))
}

async fn entry_logs(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> HandlerResult<Json<Value>> {
    let logs: Vec<ProxyLogEntry> = state.store.get(&id)?.logs();
    Ok(Json(json!({ "logs": logs })))
}

async fn clear_logs(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> HandlerResult<Json<Value>> {
    state.store.clear_logs(&id)?;
    Ok(Json(json!({ "success": true })))
}

async fn destroy_entry(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> HandlerResult<Json<Value>> {
    state.store.destroy(&id)?;
    Ok(Json(json!({ "success": true })))
}

async fn destroy_by_server(
    State(state): State<ProxyState>,
    Path(server_id): Path<String>,
) -> Json<Value> {
    let removed = state.store.destroy_by_server(&server_id);
    Json(json!({ "success": true, "removed": removed }))
}

/// Each log entry as `{type: "log", log}`, history first
fn log_events(
    subscription: LogSubscription,
) -> impl Stream<Item = std::result::Result<Event, axum::Error>> {
    stream::unfold(subscription, |mut subscription| async move {
        let log = subscription.recv().await?;
        let event = Event::default().json_data(json!({ "type": "log", "log": log }));
        Some((event, subscription))
    })
}

async fn stream_logs(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
) -> HandlerResult<Sse<impl Stream<Item = std::result::Result<Event, axum::Error>>>> {
    let subscription = state.store.subscribe(&id)?;
    Ok(Sse::new(log_events(subscription))
        .keep_alive(KeepAlive::new().interval(SSE_KEEPALIVE_INTERVAL)))
}

async fn proxy_root(
    State(state): State<ProxyState>,
    Path(id): Path<String>,
    request: Request,
) -> HandlerResult<Response> {
    proxy(state, id, String::new(), request).await
}

async fn proxy_path(
    State(state): State<ProxyState>,
    Path((id, path)): Path<(String, String)>,
    request: Request,
) -> HandlerResult<Response> {
    proxy(state, id, path, request).await
}

async fn proxy(
    state: ProxyState,
    id: String,
    suffix: String,
    request: Request,
) -> HandlerResult<Response> {
    let entry = state.store.get(&id)?;
    let base = state.public_base(request.headers());
    Ok(forward(&state, entry, &suffix, &base, request).await)
}
