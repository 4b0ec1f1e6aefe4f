//! Transport abstraction for MCP client connections
//!
//! A transport moves JSON-RPC messages to one upstream endpoint and pushes
//! everything the server sends into the inbound channel handed to it at open
//! time. The channel closing is how a connection learns its transport died;
//! a request-scoped reply stream that dies early is reported as
//! [`Inbound::Unanswered`] instead.

use super::http::{LegacySseTransport, StreamableHttpTransport};
use super::stdio::StdioTransport;
use crate::config::{HttpServerConfig, HttpTransportMode, ServerConfig, TransportConfig, TransportKind};
use crate::model::{JsonRpcMessage, RequestId};
use crate::utils::expand_env_value;
use crate::{Result, ScopeError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What a transport reports to its connection
#[derive(Debug)]
pub enum Inbound {
    /// A message from the server; `related` is the client request whose
    /// reply stream carried it
    Message {
        message: JsonRpcMessage,
        related: Option<RequestId>,
    },
    /// The reply stream for `request` ended without answering it
    Unanswered { request: RequestId, error: String },
}

impl Inbound {
    pub fn message(message: JsonRpcMessage) -> Self {
        Self::Message {
            message,
            related: None,
        }
    }
}

pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Deliver one message to the server
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;

    /// Called once the initialize handshake has completed
    async fn on_initialized(&self, _protocol_version: &str) -> Result<()> {
        Ok(())
    }

    /// Session id negotiated by HTTP transports
    fn session_id(&self) -> Option<String> {
        None
    }

    /// Release the process/socket; must be idempotent
    async fn close(&self);
}

/// Open the transport a config describes
pub async fn open(
    server_id: &str,
    config: &ServerConfig,
    inbound: InboundSender,
) -> Result<Arc<dyn Transport>> {
    match &config.transport {
        TransportConfig::Stdio(stdio) => {
            let transport = StdioTransport::spawn(server_id, stdio, inbound)?;
            Ok(Arc::new(transport))
        }
        TransportConfig::Http(http) => match http.mode {
            HttpTransportMode::Streamable => {
                let transport = StreamableHttpTransport::new(server_id, http, inbound)?;
                Ok(Arc::new(transport))
            }
            HttpTransportMode::LegacySse => {
                let transport = LegacySseTransport::connect(server_id, http, inbound).await?;
                Ok(Arc::new(transport))
            }
        },
    }
}

/// Build the static header set for an HTTP server, expanding `$env:` values
pub fn build_headers(config: &HttpServerConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ScopeError::validation(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(&expand_env_value(value)).map_err(|e| {
            ScopeError::validation(format!("invalid value for header '{}': {}", name, e))
        })?;
        headers.insert(name, value);
    }

    if let Some(ref token) = config.auth_token
        && !headers.contains_key(AUTHORIZATION)
    {
        let value = HeaderValue::from_str(&format!("Bearer {}", expand_env_value(token)))
            .map_err(|e| ScopeError::validation(format!("invalid auth token: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    }

    Ok(headers)
}
