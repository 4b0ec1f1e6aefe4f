//! Utility functions and helpers
//!
//! Common utilities used throughout mcpscope.

use crate::constants::ENV_VALUE_PREFIX;

/// Expand a `$env:NAME` value from the process environment
///
/// Values without the prefix are returned unchanged; unset variables expand
/// to an empty string.
pub fn expand_env_value(value: &str) -> String {
    lookup_env_value(value).unwrap_or_default()
}

/// Like [`expand_env_value`], but `None` when the referenced variable is unset
pub fn lookup_env_value(value: &str) -> Option<String> {
    match value.strip_prefix(ENV_VALUE_PREFIX) {
        Some(var_name) => std::env::var(var_name).ok(),
        None => Some(value.to_string()),
    }
}

/// Truncate a string to at most `max_bytes` without splitting a UTF-8 character
pub fn truncate_utf8(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
