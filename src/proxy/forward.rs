//! Request forwarding
//!
//! One call per proxied request: resolve the upstream URL, log the request,
//! send it, and hand back the upstream response with hop-by-hop headers
//! removed and CORS added. Upstream network failures become a logged 500;
//! nothing here returns an error to the router.

use super::ProxyState;
use super::rewrite::{SseRewriter, session_param};
use super::shim;
use crate::constants::{
    CORS_ALLOWED_HEADERS, CORS_ALLOWED_METHODS, CORS_EXPOSED_HEADERS, HOP_BY_HOP_HEADERS,
    RECOMPUTED_HEADERS, STREAM_PLACEHOLDER,
};
use crate::interceptor::{InterceptorEntry, ProxyLogEntry};
use crate::telemetry;
use axum::body::{Body, to_bytes};
use axum::extract::Request;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Sub-path that carries POSTs for an SSE session
const MESSAGES_SUFFIX: &str = "messages";

fn is_stripped(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .chain(RECOMPUTED_HEADERS)
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Add the wildcard CORS headers every proxied response carries
pub fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOWED_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOWED_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(CORS_EXPOSED_HEADERS),
    );
}

/// Target URL for a request
///
/// `/messages` with a known `sessionId` goes to the URL recorded for that
/// session; an unknown session falls back to the bare target. Any other suffix
/// is appended to the target path, and query parameters are merged with the
/// target's own taking precedence.
pub fn resolve_upstream(entry: &InterceptorEntry, suffix: &str, query: Option<&str>) -> Url {
    let suffix = suffix.trim_matches('/');

    if suffix == MESSAGES_SUFFIX {
        let session = query.and_then(|q| {
            Url::parse(&format!("http://local/?{}", q))
                .ok()
                .and_then(|u| session_param(&u))
        });
        if let Some(upstream) = session.and_then(|id| entry.session_endpoint(&id)) {
            return upstream;
        }
        return entry.target_url().clone();
    }

    let mut url = entry.target_url().clone();
    if !suffix.is_empty() {
        let path = format!("{}/{}", url.path().trim_end_matches('/'), suffix);
        url.set_path(&path);
    }

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        let own: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let taken: HashSet<&str> = own.iter().map(|(k, _)| k.as_str()).collect();
        let incoming: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(k, _)| !taken.contains(k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(own.iter().chain(incoming.iter()));
        drop(pairs);
    }
    url
}

/// Headers sent upstream: client headers minus hop-by-hop, then injected
/// headers (which never replace a client `Authorization`)
pub fn outbound_headers(incoming: &HeaderMap, inject: &BTreeMap<String, String>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in incoming {
        if !is_stripped(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }

    for (name, value) in inject {
        if is_stripped(name) {
            continue;
        }
        if name == "authorization" && headers.contains_key(header::AUTHORIZATION) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => tracing::warn!("Skipping invalid inject header '{}'", name),
        }
    }
    headers
}

/// Upstream response headers as seen by the client
fn inbound_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream {
        if !is_stripped(name.as_str()) {
            headers.append(name.clone(), value.clone());
        }
    }
    apply_cors(&mut headers);
    headers
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn header_str<'a>(headers: &'a HeaderMap, name: HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn preflight() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    apply_cors(response.headers_mut());
    response
}

/// Logged 500 for anything that went wrong talking to the upstream
fn upstream_failure(entry: &InterceptorEntry, message: String) -> Response {
    telemetry::record_upstream_error();
    tracing::warn!(interceptor = %entry.id(), "Upstream request failed: {}", message);

    let body = json!({
        "error": {
            "type": "proxy_upstream_error",
            "message": message,
            "status": 500,
        }
    })
    .to_string();

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    entry.append_log(ProxyLogEntry::response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &headers,
        Some(body.as_bytes()),
    ));

    apply_cors(&mut headers);
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    *response.headers_mut() = headers;
    response
}

/// Forward one request through `entry`
pub async fn forward(
    state: &ProxyState,
    entry: Arc<InterceptorEntry>,
    suffix: &str,
    proxy_base: &str,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let response = forward_inner(state, &entry, suffix, proxy_base, request).await;
    telemetry::record_proxy_request(method.as_str(), response.status().as_u16());
    response
}

async fn forward_inner(
    state: &ProxyState,
    entry: &Arc<InterceptorEntry>,
    suffix: &str,
    proxy_base: &str,
    request: Request,
) -> Response {
    if request.method() == Method::OPTIONS {
        return preflight();
    }

    let (parts, body) = request.into_parts();
    let upstream = resolve_upstream(entry, suffix, parts.uri.query());
    let headers = outbound_headers(&parts.headers, entry.inject_headers());

    if shim::wants_shim(&parts.method, &parts.headers, &upstream) {
        entry.append_log(ProxyLogEntry::request(
            parts.method.as_str(),
            upstream.as_str(),
            &headers,
            None,
        ));
        let user_agent = header_str(&parts.headers, header::USER_AGENT);
        let (_, mut response) = shim::open_session(entry.clone(), proxy_base, user_agent);
        entry.append_log(ProxyLogEntry::response_text(
            StatusCode::OK,
            response.headers(),
            STREAM_PLACEHOLDER,
        ));
        apply_cors(response.headers_mut());
        return response;
    }

    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return upstream_failure(entry, format!("Failed to read request body: {}", e));
        }
    };

    entry.append_log(ProxyLogEntry::request(
        parts.method.as_str(),
        upstream.as_str(),
        &headers,
        Some(&body),
    ));
    tracing::debug!(
        interceptor = %entry.id(),
        method = %parts.method,
        upstream = %upstream,
        "Forwarding request"
    );

    let relay = (suffix.trim_matches('/') == MESSAGES_SUFFIX)
        .then(|| {
            parts
                .uri
                .query()
                .and_then(|q| Url::parse(&format!("http://local/?{}", q)).ok())
                .and_then(|u| session_param(&u))
                .and_then(|id| entry.session_relay(&id))
        })
        .flatten();

    let outcome = state
        .client
        .request(parts.method.clone(), upstream.clone())
        .headers(headers)
        .body(body)
        .send()
        .await;
    let upstream_response = match outcome {
        Ok(response) => response,
        Err(e) => return upstream_failure(entry, format!("Failed to reach {}: {}", upstream, e)),
    };

    let status = upstream_response.status();
    let client_headers = inbound_headers(upstream_response.headers());
    let kind = content_type(upstream_response.headers()).to_ascii_lowercase();

    if kind.starts_with("text/event-stream") {
        entry.append_log(ProxyLogEntry::response_text(
            status,
            upstream_response.headers(),
            STREAM_PLACEHOLDER,
        ));
        let rewriter = SseRewriter::new(entry.clone(), upstream, proxy_base);
        let body = rewrite_stream(
            upstream_response.bytes_stream().boxed(),
            rewriter,
            entry.cancellation(),
        );
        return build_response(status, client_headers, body);
    }

    if kind.starts_with("application/x-ndjson") {
        entry.append_log(ProxyLogEntry::response_text(
            status,
            upstream_response.headers(),
            STREAM_PLACEHOLDER,
        ));
        return build_response(
            status,
            client_headers,
            Body::from_stream(upstream_response.bytes_stream()),
        );
    }

    let logged_headers = upstream_response.headers().clone();
    let bytes = match upstream_response.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return upstream_failure(entry, format!("Failed to read response from {}: {}", upstream, e));
        }
    };
    entry.append_log(ProxyLogEntry::response(status, &logged_headers, Some(&bytes)));

    if let Some(relay) = relay
        && status.is_success()
        && let Some(frame) = shim::relay_frame(&bytes)
        && relay.send(frame).is_err()
    {
        tracing::debug!(interceptor = %entry.id(), "Shim session already closed");
    }

    build_response(status, client_headers, Body::from(bytes))
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

struct RewriteState {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    rewriter: SseRewriter,
    cancel: CancellationToken,
    done: bool,
}

/// Pipe an upstream SSE body through the rewriter
///
/// Stops when the upstream ends, the client hangs up (the body is dropped),
/// or the entry is destroyed.
fn rewrite_stream(
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    rewriter: SseRewriter,
    cancel: CancellationToken,
) -> Body {
    let state = RewriteState {
        upstream,
        rewriter,
        cancel,
        done: false,
    };

    let chunks = stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            let next = tokio::select! {
                _ = st.cancel.cancelled() => None,
                chunk = st.upstream.next() => chunk,
            };
            match next {
                Some(Ok(chunk)) => match st.rewriter.feed(&chunk) {
                    Ok(out) if out.is_empty() => {}
                    Ok(out) => return Some((Ok(out), st)),
                    Err(e) => {
                        tracing::warn!("Abandoning upstream SSE stream: {}", e);
                        st.done = true;
                        return Some((Err(std::io::Error::other(e)), st));
                    }
                },
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(std::io::Error::other(e)), st));
                }
                None => {
                    st.done = true;
                    let tail = st.rewriter.finish();
                    if !tail.is_empty() {
                        return Some((Ok(tail), st));
                    }
                }
            }
        }
    });
    Body::from_stream(chunks)
}
