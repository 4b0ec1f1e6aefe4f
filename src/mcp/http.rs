//! HTTP transports for remote MCP servers
//!
//! - [`StreamableHttpTransport`]: every message is a POST; the reply is either
//!   JSON or an SSE stream. The server may assign an `Mcp-Session-Id` which is
//!   echoed on later requests and released with a DELETE on close. After the
//!   handshake a GET stream is opened for server-initiated messages (servers
//!   that answer 405 simply don't offer one).
//! - [`LegacySseTransport`]: the older two-channel scheme. A long-lived GET
//!   stream announces the POST endpoint in an `endpoint` event and carries all
//!   responses.

use super::transport::{Inbound, InboundSender, Transport, build_headers};
use crate::config::{HttpServerConfig, TransportKind};
use crate::constants::{
    HEADER_MCP_PROTOCOL_VERSION, HEADER_MCP_SESSION_ID, LEGACY_SSE_ENDPOINT_TIMEOUT,
    UPSTREAM_CONNECT_TIMEOUT,
};
use crate::model::{JsonRpcMessage, RequestId};
use crate::sse::{SseDecoder, SseEvent};
use crate::{Result, ScopeError};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use url::Url;

const ACCEPT_JSON_OR_SSE: &str = "application/json, text/event-stream";
const ACCEPT_SSE: &str = "text/event-stream";
const SESSION_DELETE_TIMEOUT: Duration = Duration::from_secs(2);

fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ScopeError::connection(format!("Failed to build HTTP client: {}", e)))
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with(ACCEPT_SSE))
        .unwrap_or(false)
}

/// Push every JSON-RPC message in `body` into the inbound channel, tagged
/// with the request whose reply carried them
///
/// Returns whether one of them answers `related`.
fn forward_json(
    server_id: &str,
    inbound: &InboundSender,
    body: &[u8],
    related: Option<&RequestId>,
) -> Result<bool> {
    let value: Value = serde_json::from_slice(body)?;
    let mut answered = false;
    for message in JsonRpcMessage::parse_batch(value)? {
        if let (Some(id), JsonRpcMessage::Response(response)) = (related, &message)
            && response.id == *id
        {
            answered = true;
        }
        let message = Inbound::Message {
            message,
            related: related.cloned(),
        };
        if inbound.send(message).is_err() {
            tracing::debug!(server = %server_id, "Inbound channel closed, dropping message");
        }
    }
    Ok(answered)
}

/// Forward a `message` event; other event types are ignored
fn forward_event(
    server_id: &str,
    inbound: &InboundSender,
    event: &SseEvent,
    related: Option<&RequestId>,
) -> bool {
    if event.event_type() != "message" || event.data.trim().is_empty() {
        return false;
    }
    forward_json(server_id, inbound, event.data.as_bytes(), related).unwrap_or_else(|e| {
        tracing::warn!(server = %server_id, "Failed to parse SSE message from server: {}", e);
        false
    })
}

/// Decode an SSE response body until it ends, `on_event` returns false, or
/// the token is cancelled
async fn pump_sse<F>(server_id: &str, response: Response, cancel: CancellationToken, mut on_event: F)
where
    F: FnMut(SseEvent) -> bool,
{
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return,
            chunk = stream.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let events = match decoder.feed(&bytes) {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(server = %server_id, "Dropping SSE stream: {}", e);
                        return;
                    }
                };
                for event in events {
                    if !on_event(event) {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                tracing::debug!(server = %server_id, "SSE stream error: {}", e);
                break;
            }
            None => break,
        }
    }

    if let Some(event) = decoder.finish() {
        on_event(event);
    }
}

// ============================================================================
// STREAMABLE HTTP
// ============================================================================

pub struct StreamableHttpTransport {
    server_id: String,
    url: Url,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    inbound: InboundSender,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    /// No network traffic happens until the first `send`
    pub fn new(server_id: &str, config: &HttpServerConfig, inbound: InboundSender) -> Result<Self> {
        Ok(Self {
            server_id: server_id.to_string(),
            url: config.url.clone(),
            client: build_client()?,
            headers: build_headers(config)?,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(None),
            inbound,
            cancel: CancellationToken::new(),
        })
    }

    fn session_headers(&self) -> HeaderMap {
        let mut headers = self.headers.clone();
        if let Some(ref id) = *self.session_id.read()
            && let Ok(value) = HeaderValue::from_str(id)
        {
            headers.insert(HEADER_MCP_SESSION_ID, value);
        }
        if let Some(ref version) = *self.protocol_version.read()
            && let Ok(value) = HeaderValue::from_str(version)
        {
            headers.insert(HEADER_MCP_PROTOCOL_VERSION, value);
        }
        headers
    }

    fn capture_session_id(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(HEADER_MCP_SESSION_ID).and_then(|v| v.to_str().ok()) {
            let mut session = self.session_id.write();
            if session.as_deref() != Some(value) {
                tracing::debug!(server = %self.server_id, session_id = value, "Captured MCP session id");
                *session = Some(value.to_string());
            }
        }
    }

    async fn open_listen_stream(&self) {
        let request = self
            .client
            .get(self.url.clone())
            .headers(self.session_headers())
            .header(ACCEPT, ACCEPT_SSE);

        let response = match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::debug!(server = %self.server_id, "GET stream unavailable: {}", e);
                return;
            }
            Err(_) => {
                tracing::debug!(server = %self.server_id, "GET stream did not answer in time");
                return;
            }
        };

        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            tracing::debug!(server = %self.server_id, "Server does not offer a GET stream");
            return;
        }
        if !response.status().is_success() || !is_event_stream(&response) {
            tracing::debug!(
                server = %self.server_id,
                status = %response.status(),
                "GET stream rejected"
            );
            return;
        }

        let server_id = self.server_id.clone();
        let inbound = self.inbound.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            pump_sse(&server_id, response, cancel, |event| {
                forward_event(&server_id, &inbound, &event, None);
                true
            })
            .await;
            tracing::debug!(server = %server_id, "GET stream ended");
        });
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ScopeError::connection(format!(
                "MCP server '{}' is closed",
                self.server_id
            )));
        }

        let request_id = match message {
            JsonRpcMessage::Request(ref request) => Some(request.id.clone()),
            _ => None,
        };

        let response = self
            .client
            .post(self.url.clone())
            .headers(self.session_headers())
            .header(ACCEPT, ACCEPT_JSON_OR_SSE)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                ScopeError::connection(format!("POST to '{}' failed: {}", self.url, e))
            })?;

        self.capture_session_id(response.headers());
        let status = response.status();

        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        if is_event_stream(&response) && status.is_success() {
            let server_id = self.server_id.clone();
            let url = self.url.clone();
            let inbound = self.inbound.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut answered = false;
                pump_sse(&server_id, response, cancel.clone(), |event| {
                    answered |= forward_event(&server_id, &inbound, &event, request_id.as_ref());
                    true
                })
                .await;

                if let Some(request) = request_id
                    && !answered
                    && !cancel.is_cancelled()
                {
                    let error = format!("Reply stream from '{}' ended before answering request {}", url, request);
                    let _ = inbound.send(Inbound::Unanswered { request, error });
                }
            });
            return Ok(());
        }

        let body = response.bytes().await.map_err(|e| {
            ScopeError::connection(format!("Failed to read response from '{}': {}", self.url, e))
        })?;

        // Some servers answer with a JSON-RPC error body on 4xx
        let forwarded = if body.is_empty() {
            Ok(false)
        } else {
            forward_json(&self.server_id, &self.inbound, &body, request_id.as_ref())
        };
        match forwarded {
            Ok(true) => return Ok(()),
            Ok(false) if status.is_success() => {
                return match request_id {
                    None => Ok(()),
                    Some(id) => Err(ScopeError::connection(format!(
                        "HTTP {} from '{}' carried no response to request {}",
                        status, self.url, id
                    ))),
                };
            }
            Err(e) if status.is_success() => {
                return Err(ScopeError::connection(format!(
                    "Invalid JSON-RPC reply from '{}': {}",
                    self.url, e
                )));
            }
            _ => {}
        }

        if status == StatusCode::NOT_FOUND && self.session_id.read().is_some() {
            return Err(ScopeError::connection(format!(
                "MCP session for '{}' expired",
                self.server_id
            )));
        }

        Err(ScopeError::connection(format!(
            "HTTP {} from '{}': {}",
            status,
            self.url,
            String::from_utf8_lossy(&body)
        )))
    }

    async fn on_initialized(&self, protocol_version: &str) -> Result<()> {
        *self.protocol_version.write() = Some(protocol_version.to_string());
        self.open_listen_stream().await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        if self.session_id.read().is_none() {
            return;
        }
        let request = self
            .client
            .delete(self.url.clone())
            .headers(self.session_headers())
            .timeout(SESSION_DELETE_TIMEOUT);
        if let Err(e) = request.send().await {
            tracing::debug!(server = %self.server_id, "Failed to release MCP session: {}", e);
        }
    }
}

// ============================================================================
// LEGACY SSE
// ============================================================================

pub struct LegacySseTransport {
    server_id: String,
    endpoint: Url,
    client: reqwest::Client,
    headers: HeaderMap,
    session_id: Option<String>,
    cancel: CancellationToken,
}

impl LegacySseTransport {
    /// Open the event stream and wait for the server to announce its POST endpoint
    pub async fn connect(server_id: &str, config: &HttpServerConfig, inbound: InboundSender) -> Result<Self> {
        let client = build_client()?;
        let headers = build_headers(config)?;

        let request = client
            .get(config.url.clone())
            .headers(headers.clone())
            .header(ACCEPT, ACCEPT_SSE)
            .send();
        let response = tokio::time::timeout(LEGACY_SSE_ENDPOINT_TIMEOUT, request)
            .await
            .map_err(|_| {
                ScopeError::connection(format!(
                    "GET '{}' did not answer within {}s",
                    config.url,
                    LEGACY_SSE_ENDPOINT_TIMEOUT.as_secs()
                ))
            })?
            .map_err(|e| ScopeError::connection(format!("GET '{}' failed: {}", config.url, e)))?;

        if !response.status().is_success() {
            return Err(ScopeError::connection(format!(
                "HTTP {} opening SSE stream at '{}'",
                response.status(),
                config.url
            )));
        }

        let cancel = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        {
            let server_id = server_id.to_string();
            let cancel = cancel.clone();
            let mut endpoint_tx = Some(endpoint_tx);
            tokio::spawn(async move {
                pump_sse(&server_id, response, cancel, |event| {
                    if event.event_type() == "endpoint" {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(event.data);
                        }
                    } else {
                        forward_event(&server_id, &inbound, &event, None);
                    }
                    true
                })
                .await;
                tracing::debug!(server = %server_id, "Legacy SSE stream ended");
                // The stream task owns the only inbound sender; dropping it
                // tells the connection the server is gone
                drop(inbound);
            });
        }

        let announced = match tokio::time::timeout(LEGACY_SSE_ENDPOINT_TIMEOUT, endpoint_rx).await {
            Ok(Ok(data)) => data,
            Ok(Err(_)) => {
                cancel.cancel();
                return Err(ScopeError::connection(format!(
                    "SSE stream from '{}' closed before announcing an endpoint",
                    config.url
                )));
            }
            Err(_) => {
                cancel.cancel();
                return Err(ScopeError::connection(format!(
                    "No endpoint event from '{}' within {}s",
                    config.url,
                    LEGACY_SSE_ENDPOINT_TIMEOUT.as_secs()
                )));
            }
        };

        let endpoint = match resolve_endpoint(&config.url, &announced) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                cancel.cancel();
                return Err(e);
            }
        };
        let session_id = endpoint
            .query_pairs()
            .find(|(k, _)| k == "sessionId" || k == "session_id")
            .map(|(_, v)| v.into_owned());

        tracing::debug!(server = %server_id, endpoint = %endpoint, "Legacy SSE endpoint announced");

        Ok(Self {
            server_id: server_id.to_string(),
            endpoint,
            client,
            headers,
            session_id,
            cancel,
        })
    }
}

/// Resolve endpoint event data (a path, absolute URL, or `{"url": ...}`)
/// against the stream URL
pub fn resolve_endpoint(base: &Url, data: &str) -> Result<Url> {
    let data = data.trim();
    let raw = match serde_json::from_str::<Value>(data) {
        Ok(Value::Object(obj)) => obj
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| ScopeError::connection("endpoint event has no url"))?,
        _ => data.to_string(),
    };
    Ok(base.join(&raw)?)
}

#[async_trait]
impl Transport for LegacySseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ScopeError::connection(format!(
                "MCP server '{}' is closed",
                self.server_id
            )));
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .headers(self.headers.clone())
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                ScopeError::connection(format!("POST to '{}' failed: {}", self.endpoint, e))
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            ScopeError::connection(format!("Failed to read response from '{}': {}", self.endpoint, e))
        })?;

        if !status.is_success() {
            return Err(ScopeError::connection(format!(
                "HTTP {} from '{}': {}",
                status,
                self.endpoint,
                String::from_utf8_lossy(&body)
            )));
        }

        // Responses arrive on the stream; the POST body is just an acknowledgement
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }

    async fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for StreamableHttpTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for LegacySseTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
