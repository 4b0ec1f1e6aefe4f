//! HTTP server for mcpscope
//!
//! Serves the server-management and elicitation API used by the inspector UI,
//! the interceptor management API, and the forwarding proxy itself.

pub mod elicitation;
pub mod servers;

use crate::config::{Config, HttpConfig, ServerConfig};
use crate::interceptor::InterceptorStore;
use crate::mcp::{ManagerOptions, McpManager};
use crate::model::ElicitationRequest;
use crate::proxy::{self, ProxyState};
use crate::{Result, ScopeError};
use axum::{
    Router,
    extract::{FromRef, Json},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    LatencyUnit,
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

/// Elicitation requests buffered for slow stream readers
const ELICITATION_CHANNEL_CAPACITY: usize = 64;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<McpManager>,
    pub store: Arc<InterceptorStore>,
    proxy: ProxyState,
    elicitations: broadcast::Sender<ElicitationRequest>,
}

impl FromRef<AppState> for ProxyState {
    fn from_ref(state: &AppState) -> Self {
        state.proxy.clone()
    }
}

impl AppState {
    pub fn new(
        manager: Arc<McpManager>,
        store: Arc<InterceptorStore>,
        public_url: Option<String>,
    ) -> Result<Self> {
        let proxy = ProxyState::new(store.clone(), manager.clone(), public_url)?;
        let (elicitations, _) = broadcast::channel(ELICITATION_CHANNEL_CAPACITY);
        Ok(Self {
            manager,
            store,
            proxy,
            elicitations,
        })
    }

    /// Live feed of parked elicitation requests
    pub fn subscribe_elicitations(&self) -> broadcast::Receiver<ElicitationRequest> {
        self.elicitations.subscribe()
    }

    /// Route a server's elicitations to the pending table and announce them
    /// to stream subscribers
    pub fn bind_elicitations(&self, name: &str) {
        let events = self.elicitations.clone();
        self.manager
            .set_pending_elicitation_handler(name, move |request: &ElicitationRequest| {
                // no subscribers is fine; the request stays listed as pending
                let _ = events.send(request.clone());
            });
    }

    /// Bind elicitations, then connect
    pub async fn connect_server(&self, name: &str, config: ServerConfig) -> Result<()> {
        self.bind_elicitations(name);
        self.manager.connect_to_server(name, config).await?;
        Ok(())
    }
}

/// Error type for HTTP handlers
#[derive(Debug)]
pub struct AppError(ScopeError);

impl AppError {
    pub fn inner(&self) -> &ScopeError {
        &self.0
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self.0 {
            ScopeError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ScopeError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "validation_error", msg.clone())
            }
            ScopeError::Timeout { .. } => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout", self.0.to_string())
            }
            ScopeError::ElicitationTimeout(msg) => (
                StatusCode::GATEWAY_TIMEOUT,
                "elicitation_timeout",
                msg.clone(),
            ),
            ScopeError::Connection(msg) => {
                (StatusCode::BAD_GATEWAY, "connection_error", msg.clone())
            }
            ScopeError::Protocol { .. } => {
                (StatusCode::BAD_GATEWAY, "protocol_error", self.0.to_string())
            }
            ScopeError::ProxyUpstream(msg) => {
                (StatusCode::BAD_GATEWAY, "proxy_upstream_error", msg.clone())
            }
            ScopeError::ToolExecution(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "tool_execution_error",
                msg.clone(),
            ),
            _ => {
                // Log full error details internally
                tracing::error!("Internal error: {:?}", self.0);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "An internal error occurred".to_string(),
                )
            }
        };

        tracing::debug!(
            error_type = error_type,
            status = %status,
            message = %message,
            "HTTP request error response"
        );

        let body = json!({
            "error": {
                "type": error_type,
                "message": message,
                "status": status.as_u16(),
            }
        });

        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<ScopeError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

/// Start the HTTP server
///
/// Configured servers are connected first; a server that fails to connect
/// is kept in the list with status `error` and does not stop startup.
pub async fn start_server(config: Config) -> Result<()> {
    config.validate()?;
    let http_config = config.get_http();
    let limits = config.get_limits();

    let manager = Arc::new(McpManager::new(ManagerOptions::from(&limits)));
    let store = Arc::new(InterceptorStore::new(limits.max_log_entries));
    let state = AppState::new(manager.clone(), store, http_config.public_url.clone())?;

    let mut servers: Vec<_> = config.mcp_servers.clone().unwrap_or_default().into_iter().collect();
    servers.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, server) in servers {
        match state.connect_server(&name, server).await {
            Ok(()) => tracing::info!(server = %name, "Connected MCP server"),
            Err(e) => tracing::warn!(server = %name, "MCP server unavailable at startup: {}", e),
        }
    }

    let app = build_router(state, &http_config)?;

    let addr = format!("{}:{}", http_config.host, http_config.port);
    let socket_addr: SocketAddr = addr
        .parse()
        .map_err(|e| ScopeError::config(format!("Invalid address {}: {}", addr, e)))?;

    tracing::info!("Starting HTTP server on {}", socket_addr);

    let listener = tokio::net::TcpListener::bind(socket_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ScopeError::config(format!("Server error: {}", e)))?;

    tracing::info!("Shutting down, disconnecting MCP servers");
    manager.disconnect_all_servers().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// CORS for the management APIs: localhost origins unless configured
fn management_cors(http_config: &HttpConfig) -> Result<CorsLayer> {
    let origins = match http_config.allowed_origins {
        Some(ref origins) => origins.clone(),
        None => vec![
            format!("http://localhost:{}", http_config.port),
            format!("http://127.0.0.1:{}", http_config.port),
        ],
    };
    let origins = origins
        .iter()
        .map(|o| {
            o.parse::<HeaderValue>()
                .map_err(|e| ScopeError::config(format!("Invalid CORS origin '{}': {}", o, e)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]))
}

/// Build the router with all endpoints
///
/// The forwarding routes sit outside the management CORS layer; the proxy
/// answers preflights itself with a wildcard policy.
pub fn build_router(state: AppState, http_config: &HttpConfig) -> Result<Router> {
    let management = Router::new()
        .merge(servers::routes())
        .merge(elicitation::routes())
        .merge(proxy::management_routes())
        .layer(management_cors(http_config)?);

    Ok(Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(management)
        .merge(proxy::forwarding_routes())
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().include_headers(false))
                    .on_response(
                        DefaultOnResponse::new()
                            .level(tracing::Level::INFO)
                            .latency_unit(LatencyUnit::Micros),
                    ),
            ),
        )
        .with_state(state))
}

// ============================================================================
// SYSTEM HANDLERS
// ============================================================================

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics_handler() -> std::result::Result<(StatusCode, String), AppError> {
    let metrics = crate::telemetry::get_metrics()?;
    Ok((StatusCode::OK, metrics))
}
