//! Live rewriting of upstream SSE streams
//!
//! Lines are forwarded byte-for-byte except for the `data:` line of an
//! endpoint announcement, which is swapped for a proxy-local URL so that
//! follow-up POSTs come back through the proxy. Endpoint detection is a
//! heuristic: an `endpoint` event, or a non-JSON-RPC payload that looks like a
//! `/message?` or `/messages?` URL. Upstreams that announce their endpoint any
//! other way are forwarded untouched.

use crate::interceptor::{InterceptorEntry, ProxyLogEntry};
use crate::sse::{EventBuilder, LineDecoder, LineTooLong, RawLine, SseField, parse_field};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::CONTENT_TYPE};
use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

static MESSAGE_ENDPOINT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/messages?\?").unwrap());

/// How the upstream phrased its endpoint; the rewrite keeps the same form
#[derive(Debug, Clone, PartialEq, Eq)]
enum EndpointForm {
    Json,
    Plain,
}

/// Session query parameter, in either spelling
pub fn session_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == "sessionId" || k == "session_id")
        .map(|(_, v)| v.into_owned())
        .filter(|v| !v.is_empty())
}

/// Proxy-local URL that future POSTs for `session_id` must use
pub fn proxy_messages_url(proxy_base: &str, entry_id: &str, session_id: &str) -> String {
    format!(
        "{}/proxy/{}/messages?sessionId={}",
        proxy_base.trim_end_matches('/'),
        entry_id,
        session_id
    )
}

fn is_json_rpc(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.contains_key("jsonrpc"),
        Value::Array(items) => items.iter().any(is_json_rpc),
        _ => false,
    }
}

/// Pull the announced URL out of a data payload, if it is one
fn extract_endpoint(event_type: Option<&str>, data: &str) -> Option<(String, EndpointForm)> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return None;
    }
    let announced = event_type == Some("endpoint");

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if is_json_rpc(&value) => None,
        Ok(Value::Object(map)) => {
            let url = map.get("url").and_then(Value::as_str)?;
            (announced || MESSAGE_ENDPOINT.is_match(url))
                .then(|| (url.to_string(), EndpointForm::Json))
        }
        Ok(Value::String(url)) if announced || MESSAGE_ENDPOINT.is_match(&url) => {
            Some((url, EndpointForm::Plain))
        }
        Ok(_) => None,
        Err(_) => (announced || MESSAGE_ENDPOINT.is_match(trimmed))
            .then(|| (trimmed.to_string(), EndpointForm::Plain)),
    }
}

/// Streaming rewriter for one upstream SSE response
pub struct SseRewriter {
    entry: Arc<InterceptorEntry>,
    upstream: Url,
    proxy_base: String,
    lines: LineDecoder,
    builder: EventBuilder,
}

impl SseRewriter {
    /// `upstream` is the URL the stream was fetched from; relative endpoints
    /// resolve against it
    pub fn new(entry: Arc<InterceptorEntry>, upstream: Url, proxy_base: impl Into<String>) -> Self {
        Self {
            entry,
            upstream,
            proxy_base: proxy_base.into(),
            lines: LineDecoder::new(),
            builder: EventBuilder::new(),
        }
    }

    /// Feed an upstream chunk; returns the bytes to send downstream
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Bytes, LineTooLong> {
        let mut out = BytesMut::new();
        for line in self.lines.feed(chunk)? {
            self.process(line, &mut out);
        }
        Ok(out.freeze())
    }

    /// Upstream ended; flush a trailing partial line
    pub fn finish(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        if let Some(line) = self.lines.finish() {
            self.process(line, &mut out);
        }
        out.freeze()
    }

    fn process(&mut self, line: RawLine, out: &mut BytesMut) {
        let text = line.text().into_owned();
        let field = parse_field(&text);

        let replacement = match field {
            SseField::Data(data) => self.rewrite_endpoint(self.builder.current_event(), data),
            _ => None,
        };
        match replacement {
            Some(data) => {
                out.extend_from_slice(b"data: ");
                out.extend_from_slice(data.as_bytes());
                // a flushed partial line has no terminator; the rewritten one gets "\n"
                if line.terminator().is_empty() {
                    out.extend_from_slice(b"\n");
                } else {
                    out.extend_from_slice(line.terminator());
                }
            }
            None => out.extend_from_slice(line.raw()),
        }

        if let Some(event) = self.builder.push(field)
            && event.event_type() == "message"
        {
            self.mirror_message(&event.data);
        }
    }

    fn rewrite_endpoint(&self, event_type: Option<&str>, data: &str) -> Option<String> {
        let (raw, form) = extract_endpoint(event_type, data)?;
        let resolved = match self.upstream.join(&raw) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(
                    interceptor = %self.entry.id(),
                    "Leaving unparseable endpoint '{}' untouched: {}",
                    raw,
                    e
                );
                return None;
            }
        };

        let session_id = session_param(&resolved).unwrap_or_else(|| Uuid::new_v4().to_string());
        tracing::debug!(
            interceptor = %self.entry.id(),
            session = %session_id,
            upstream = %resolved,
            "Rewriting SSE endpoint"
        );
        self.entry.set_session_endpoint(session_id.clone(), resolved);

        let local = proxy_messages_url(&self.proxy_base, self.entry.id(), &session_id);
        Some(match form {
            EndpointForm::Json => json!({ "url": local }).to_string(),
            EndpointForm::Plain => local,
        })
    }

    fn mirror_message(&self, data: &str) {
        let body = match serde_json::from_str::<Value>(data) {
            Ok(value) => value.to_string(),
            Err(_) => data.to_string(),
        };
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.entry
            .append_log(ProxyLogEntry::response_text(StatusCode::OK, &headers, body));
    }
}
