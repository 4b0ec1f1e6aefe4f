//! Synthetic SSE sessions for upstreams without a persistent channel
//!
//! The proxy answers the client's GET itself: a `ping`, then an `endpoint`
//! event pointing at `/proxy/{id}/messages?sessionId=...`, then keepalive
//! comments. Responses to POSTs on that session are relayed into the stream.

use super::rewrite::proxy_messages_url;
use crate::constants::{SSE_KEEPALIVE_INTERVAL, STRING_ENDPOINT_ONLY_USER_AGENTS};
use crate::interceptor::InterceptorEntry;
use crate::sse::{SseEvent, encode_comment};
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use bytes::Bytes;
use futures::stream;
use serde_json::json;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, interval_at};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

/// The shim takes over event-stream GETs aimed at non-SSE endpoints
pub fn wants_shim(method: &axum::http::Method, headers: &HeaderMap, upstream: &Url) -> bool {
    let accepts_sse = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/event-stream"));
    method == axum::http::Method::GET && accepts_sse && !looks_like_sse_endpoint(upstream)
}

pub fn looks_like_sse_endpoint(url: &Url) -> bool {
    url.path().trim_end_matches('/').ends_with("/sse")
}

/// Clients matched here choke on the JSON endpoint form
pub fn string_endpoint_only(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else {
        return false;
    };
    let ua = ua.to_ascii_lowercase();
    STRING_ENDPOINT_ONLY_USER_AGENTS
        .iter()
        .any(|needle| ua.contains(needle))
}

/// Frames sent before anything else on a new session
pub fn opening_frames(endpoint: &str, string_only: bool) -> Vec<Bytes> {
    let mut frames = vec![SseEvent::new("ping", "{}").encode()];
    if !string_only {
        frames.push(SseEvent::new("endpoint", json!({ "url": endpoint }).to_string()).encode());
    }
    frames.push(SseEvent::new("endpoint", endpoint).encode());
    frames
}

/// Removes the session mapping once the client goes away
struct SessionGuard {
    entry: Arc<InterceptorEntry>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.entry.remove_session(&self.session_id);
        tracing::debug!(
            interceptor = %self.entry.id(),
            session = %self.session_id,
            "Shim session closed"
        );
    }
}

struct ShimStream {
    opening: VecDeque<Bytes>,
    relay: mpsc::UnboundedReceiver<Bytes>,
    keepalive: Interval,
    cancel: CancellationToken,
    _guard: SessionGuard,
}

/// Open a synthetic session against the entry's base target
///
/// Returns the session id with the streaming response.
pub fn open_session(
    entry: Arc<InterceptorEntry>,
    proxy_base: &str,
    user_agent: Option<&str>,
) -> (String, Response<Body>) {
    let session_id = Uuid::new_v4().to_string();
    let endpoint = proxy_messages_url(proxy_base, entry.id(), &session_id);

    let (tx, rx) = mpsc::unbounded_channel();
    entry.set_session_endpoint(session_id.clone(), entry.target_url().clone());
    entry.register_session_relay(session_id.clone(), tx);

    tracing::info!(
        interceptor = %entry.id(),
        session = %session_id,
        "Opened shim SSE session"
    );

    let state = ShimStream {
        opening: opening_frames(&endpoint, string_endpoint_only(user_agent)).into(),
        relay: rx,
        keepalive: interval_at(
            Instant::now() + SSE_KEEPALIVE_INTERVAL,
            SSE_KEEPALIVE_INTERVAL,
        ),
        cancel: entry.cancellation(),
        _guard: SessionGuard {
            entry,
            session_id: session_id.clone(),
        },
    };

    let frames = stream::unfold(state, |mut st| async move {
        if let Some(frame) = st.opening.pop_front() {
            return Some((Ok::<_, Infallible>(frame), st));
        }
        let next = tokio::select! {
            _ = st.cancel.cancelled() => None,
            relayed = st.relay.recv() => relayed,
            _ = st.keepalive.tick() => Some(encode_comment("keepalive")),
        };
        next.map(|frame| (Ok(frame), st))
    });

    let mut response = Response::new(Body::from_stream(frames));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    (session_id, response)
}

/// Wrap a relayed response body as a `message` event
pub fn relay_frame(body: &[u8]) -> Option<Bytes> {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(SseEvent::new("message", text).encode())
}
