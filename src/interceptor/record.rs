//! Captured traffic records

use crate::constants::MAX_BODY_CAPTURE_BYTES;
use crate::utils::truncate_utf8;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One logged request or response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: LogPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "direction", rename_all = "lowercase")]
pub enum LogPayload {
    Request {
        method: String,
        url: String,
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Response {
        status: u16,
        #[serde(rename = "statusText")]
        status_text: String,
        headers: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
}

impl ProxyLogEntry {
    fn new(payload: LogPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn request(method: &str, url: &str, headers: &HeaderMap, body: Option<&[u8]>) -> Self {
        Self::new(LogPayload::Request {
            method: method.to_string(),
            url: url.to_string(),
            headers: header_snapshot(headers),
            body: body.and_then(capture_body),
        })
    }

    pub fn response(status: StatusCode, headers: &HeaderMap, body: Option<&[u8]>) -> Self {
        Self::new(LogPayload::Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: header_snapshot(headers),
            body: body.and_then(capture_body),
        })
    }

    /// Response entry with a literal body (placeholders, mirrored SSE messages)
    pub fn response_text(status: StatusCode, headers: &HeaderMap, body: impl Into<String>) -> Self {
        Self::new(LogPayload::Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: header_snapshot(headers),
            body: Some(body.into()),
        })
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        match &self.payload {
            LogPayload::Request { headers, .. } | LogPayload::Response { headers, .. } => headers,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match &self.payload {
            LogPayload::Request { body, .. } | LogPayload::Response { body, .. } => body.as_deref(),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.payload, LogPayload::Request { .. })
    }

    /// Mask credential headers in place
    pub fn mask(&mut self) {
        let headers = match &mut self.payload {
            LogPayload::Request { headers, .. } | LogPayload::Response { headers, .. } => headers,
        };
        for (name, value) in headers.iter_mut() {
            if name.eq_ignore_ascii_case("authorization") {
                *value = mask_authorization(value);
            }
        }
    }
}

/// `Bearer xyz` becomes `Bearer ***`; any other scheme is hidden entirely
pub fn mask_authorization(value: &str) -> String {
    match value.split_once(' ') {
        Some((scheme, _)) if !scheme.is_empty() => format!("{} ***", scheme),
        _ => "***".to_string(),
    }
}

/// Lowercased header names, repeated values joined with ", "
fn header_snapshot(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut snapshot: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        snapshot
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    if let Some(auth) = snapshot.get_mut("authorization") {
        *auth = mask_authorization(auth);
    }
    snapshot
}

fn capture_body(body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(body);
    let kept = truncate_utf8(&text, MAX_BODY_CAPTURE_BYTES);
    if kept.len() < text.len() {
        Some(format!("{}\n[truncated {} bytes]", kept, text.len() - kept.len()))
    } else {
        Some(kept.to_string())
    }
}
