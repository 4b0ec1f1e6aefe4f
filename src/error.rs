//! Error types for mcpscope
//!
//! This module provides the error hierarchy using thiserror. Connection,
//! timeout and protocol failures are kept distinct so callers can decide
//! whether a retry makes sense.

use serde_json::Value;
use thiserror::Error;

/// Main error type for mcpscope operations
#[derive(Error, Debug)]
pub enum ScopeError {
    /// Handshake or transport failure (spawn failed, socket closed, server exited)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A request exceeded its configured deadline
    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// Well-formed JSON-RPC error returned by the server
    #[error("Protocol error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// Tool ran but reported `isError: true`
    #[error("Tool execution failed: {0}")]
    ToolExecution(String),

    /// Nobody answered an elicitation within the window
    #[error("Elicitation timed out: {0}")]
    ElicitationTimeout(String),

    /// Network failure while forwarding proxied traffic
    #[error("Upstream proxy error: {0}")]
    ProxyUpstream(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Convenient result type for mcpscope operations
pub type Result<T> = std::result::Result<T, ScopeError>;

impl ScopeError {
    /// Create a connection error
    #[inline]
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        ScopeError::Connection(msg.into())
    }

    /// Create a timeout error for a request method
    #[inline]
    pub fn timeout<S: Into<String>>(method: S, timeout_ms: u64) -> Self {
        ScopeError::Timeout {
            method: method.into(),
            timeout_ms,
        }
    }

    /// Create a protocol error from a JSON-RPC error object
    #[inline]
    pub fn protocol<S: Into<String>>(code: i64, message: S, data: Option<Value>) -> Self {
        ScopeError::Protocol {
            code,
            message: message.into(),
            data,
        }
    }

    /// Create a not found error
    #[inline]
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        ScopeError::NotFound(msg.into())
    }

    /// Create a validation error
    #[inline]
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        ScopeError::Validation(msg.into())
    }

    /// Create a config error
    #[inline]
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ScopeError::Config(msg.into())
    }

    /// Create an upstream proxy error
    #[inline]
    pub fn proxy_upstream<S: Into<String>>(msg: S) -> Self {
        ScopeError::ProxyUpstream(msg.into())
    }

    /// Whether retrying the same call could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ScopeError::Timeout { .. } | ScopeError::ProxyUpstream(_) | ScopeError::Network(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinct_from_protocol() {
        let timeout = ScopeError::timeout("tools/call", 500);
        let protocol = ScopeError::protocol(-32601, "Method not found", None);

        assert!(timeout.is_retryable());
        assert!(!protocol.is_retryable());
        assert_eq!(
            timeout.to_string(),
            "Request 'tools/call' timed out after 500ms"
        );
        assert_eq!(protocol.to_string(), "Protocol error -32601: Method not found");
    }

    #[test]
    fn test_from_json_error() {
        let err: ScopeError = serde_json::from_str::<Value>("{").unwrap_err().into();
        assert!(matches!(err, ScopeError::Json(_)));
    }
}
