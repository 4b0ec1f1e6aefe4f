//! Interception proxy
//!
//! Forwards traffic for an interceptor entry to its upstream target while
//! mirroring every exchange into the entry's log. SSE handshakes are
//! rewritten (or fabricated, for upstreams that only take POSTs) so the proxy
//! stays in the loop for every later message of the session.

mod forward;
mod rewrite;
mod routes;
mod shim;

pub use forward::{apply_cors, forward, outbound_headers, resolve_upstream};
pub use rewrite::{SseRewriter, proxy_messages_url, session_param};
pub use routes::{forwarding_routes, management_routes};
pub use shim::{looks_like_sse_endpoint, opening_frames, string_endpoint_only};

use crate::constants::UPSTREAM_CONNECT_TIMEOUT;
use crate::interceptor::InterceptorStore;
use crate::mcp::McpManager;
use crate::{Result, ScopeError};
use axum::http::HeaderMap;
use std::sync::Arc;

/// Everything the proxy handlers need
#[derive(Clone)]
pub struct ProxyState {
    pub store: Arc<InterceptorStore>,
    pub manager: Arc<McpManager>,
    pub client: reqwest::Client,
    /// Externally visible base URL; derived from request headers when unset
    pub public_url: Option<String>,
}

impl ProxyState {
    pub fn new(
        store: Arc<InterceptorStore>,
        manager: Arc<McpManager>,
        public_url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            manager,
            client: build_client()?,
            public_url,
        })
    }

    /// Base URL used when minting proxy URLs
    pub fn public_base(&self, headers: &HeaderMap) -> String {
        if let Some(ref url) = self.public_url {
            return url.trim_end_matches('/').to_string();
        }

        let first = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let scheme = first("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
        let host = first("x-forwarded-host")
            .or_else(|| first("host"))
            .unwrap_or_else(|| "localhost".to_string());
        format!("{}://{}", scheme, host)
    }
}

/// Upstream client: no overall timeout since SSE bodies stay open indefinitely
fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| ScopeError::config(format!("Failed to build proxy HTTP client: {}", e)))
}
