//! Configuration management for mcpscope
//!
//! Loads and manages configuration from mcpscope.config.json. MCP server
//! entries are validated into a tagged [`TransportConfig`] at load time so the
//! rest of the crate never has to guess a transport from which fields exist.

use crate::constants::{
    CONFIG_FILE_NAME, DEFAULT_ELICITATION_TIMEOUT_MS, DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT,
    DEFAULT_MAX_LOG_ENTRIES, DEFAULT_REQUEST_TIMEOUT_MS, ENV_HOST, ENV_PORT, ENV_PUBLIC_URL,
};
use crate::{Result, ScopeError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Complete mcpscope configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,

    /// Logging configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,

    /// Timeouts and buffer sizes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    /// MCP servers to connect on startup, keyed by server name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<HashMap<String, ServerConfig>>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Externally visible base URL used when minting proxy URLs.
    /// If not set, derived from the incoming request's Host header.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    /// Allowed CORS origins for the server-management API.
    /// If not specified, defaults to localhost origins on the configured port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_origins: Option<Vec<String>>,
}

fn default_host() -> String {
    DEFAULT_HTTP_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_HTTP_PORT
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            allowed_origins: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Timeouts and buffer sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    /// Default deadline for every MCP request
    /// Default: 60000
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Window for answering an elicitation before it is rejected
    /// Default: 45000
    #[serde(default = "default_elicitation_timeout_ms")]
    pub elicitation_timeout_ms: u64,

    /// Log entries retained per interceptor entry
    /// Default: 1000
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_elicitation_timeout_ms() -> u64 {
    DEFAULT_ELICITATION_TIMEOUT_MS
}

fn default_max_log_entries() -> usize {
    DEFAULT_MAX_LOG_ENTRIES
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            elicitation_timeout_ms: default_elicitation_timeout_ms(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

impl LimitsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn elicitation_timeout(&self) -> Duration {
        Duration::from_millis(self.elicitation_timeout_ms)
    }
}

// ============================================================================
// MCP SERVER CONFIGURATION
// ============================================================================

/// Configuration for one MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawServerConfig", into = "RawServerConfig")]
pub struct ServerConfig {
    /// How to reach the server
    pub transport: TransportConfig,

    /// Per-server request timeout override
    pub timeout_ms: Option<u64>,
}

/// Transport variant, decided once when the config is built
#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    /// Spawn a subprocess and speak over its stdin/stdout
    Stdio(StdioServerConfig),
    /// Reach a remote endpoint over HTTP
    Http(HttpServerConfig),
}

/// Subprocess transport settings
#[derive(Debug, Clone, PartialEq)]
pub struct StdioServerConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment; `$env:NAME` values are expanded at spawn time
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// HTTP transport settings
#[derive(Debug, Clone, PartialEq)]
pub struct HttpServerConfig {
    pub url: Url,
    /// Extra request headers; `$env:NAME` values are expanded at connect time
    pub headers: HashMap<String, String>,
    /// Bearer token sent as `Authorization: Bearer <token>`
    pub auth_token: Option<String>,
    pub mode: HttpTransportMode,
}

/// Flavor of HTTP transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpTransportMode {
    /// Streamable HTTP (POST + optional GET event stream)
    Streamable,
    /// Legacy HTTP+SSE (GET event stream announcing a POST endpoint)
    LegacySse,
}

/// Transport discriminator exposed in summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl ServerConfig {
    /// Build a stdio server config
    pub fn stdio<S: Into<String>>(command: S, args: Vec<String>) -> Self {
        Self {
            transport: TransportConfig::Stdio(StdioServerConfig {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            }),
            timeout_ms: None,
        }
    }

    /// Build an HTTP server config; the transport flavor is inferred from the path
    pub fn http(url: &str) -> Result<Self> {
        let url = parse_http_url(url)?;
        let mode = HttpTransportMode::infer(&url);
        Ok(Self {
            transport: TransportConfig::Http(HttpServerConfig {
                url,
                headers: HashMap::new(),
                auth_token: None,
                mode,
            }),
            timeout_ms: None,
        })
    }

    /// Add an environment variable (stdio only, ignored for HTTP)
    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let TransportConfig::Stdio(ref mut stdio) = self.transport {
            stdio.env.insert(key.into(), value.into());
        }
        self
    }

    /// Add a request header (HTTP only, ignored for stdio)
    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let TransportConfig::Http(ref mut http) = self.transport {
            http.headers.insert(key.into(), value.into());
        }
        self
    }

    /// Set a bearer token (HTTP only, ignored for stdio)
    pub fn with_auth_token<S: Into<String>>(mut self, token: S) -> Self {
        if let TransportConfig::Http(ref mut http) = self.transport {
            http.auth_token = Some(token.into());
        }
        self
    }

    /// Override the request timeout for this server
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportConfig::Stdio(_) => TransportKind::Stdio,
            TransportConfig::Http(_) => TransportKind::Http,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl HttpTransportMode {
    /// Endpoints whose path ends in `/sse` speak the legacy transport
    pub fn infer(url: &Url) -> Self {
        if url.path().trim_end_matches('/').ends_with("/sse") {
            HttpTransportMode::LegacySse
        } else {
            HttpTransportMode::Streamable
        }
    }
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ScopeError::validation(format!("invalid server url '{}': {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ScopeError::validation(format!(
            "unsupported url scheme '{}' in '{}': must be http or https",
            other, raw
        ))),
    }
}

/// Wire shape of a server entry: a bare URL or a flat object
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawServerConfig {
    Url(String),
    Object(RawServerObject),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    /// stdio | http | streamable-http | sse
    #[serde(skip_serializing_if = "Option::is_none")]
    transport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout_ms: Option<u64>,
}

impl TryFrom<RawServerConfig> for ServerConfig {
    type Error = ScopeError;

    fn try_from(raw: RawServerConfig) -> Result<Self> {
        let raw = match raw {
            RawServerConfig::Url(url) => {
                if !url.contains("://") {
                    return Err(ScopeError::validation(format!(
                        "invalid MCP server config string '{}': must be a full URL (http://... or https://...) or a JSON object",
                        url
                    )));
                }
                RawServerObject {
                    url: Some(url),
                    ..Default::default()
                }
            }
            RawServerConfig::Object(obj) => obj,
        };

        if raw.timeout_ms == Some(0) {
            return Err(ScopeError::validation("timeoutMs must be greater than 0"));
        }

        let transport = match (raw.command, raw.url) {
            (Some(_), Some(_)) => {
                return Err(ScopeError::validation(
                    "server config must specify either 'command' or 'url', not both",
                ));
            }
            (None, None) => {
                return Err(ScopeError::validation(
                    "server config must specify 'command' (stdio) or 'url' (http)",
                ));
            }
            (Some(command), None) => {
                if command.trim().is_empty() {
                    return Err(ScopeError::validation("server 'command' cannot be empty"));
                }
                if let Some(t) = raw.transport.as_deref()
                    && t != "stdio"
                {
                    return Err(ScopeError::validation(format!(
                        "transport '{}' requires a 'url', not a 'command'",
                        t
                    )));
                }
                TransportConfig::Stdio(StdioServerConfig {
                    command,
                    args: raw.args.unwrap_or_default(),
                    env: raw.env.unwrap_or_default(),
                    cwd: raw.cwd.map(PathBuf::from),
                })
            }
            (None, Some(url)) => {
                let url = parse_http_url(&url)?;
                let mode = match raw.transport.as_deref() {
                    None | Some("http") => HttpTransportMode::infer(&url),
                    Some("streamable-http") => HttpTransportMode::Streamable,
                    Some("sse") => HttpTransportMode::LegacySse,
                    Some(other) => {
                        return Err(ScopeError::validation(format!(
                            "unsupported transport '{}' for url server (expected http, streamable-http or sse)",
                            other
                        )));
                    }
                };
                TransportConfig::Http(HttpServerConfig {
                    url,
                    headers: raw.headers.unwrap_or_default(),
                    auth_token: raw.auth_token,
                    mode,
                })
            }
        };

        Ok(ServerConfig {
            transport,
            timeout_ms: raw.timeout_ms,
        })
    }
}

impl From<ServerConfig> for RawServerConfig {
    fn from(config: ServerConfig) -> Self {
        let mut raw = RawServerObject {
            timeout_ms: config.timeout_ms,
            ..Default::default()
        };
        match config.transport {
            TransportConfig::Stdio(stdio) => {
                raw.command = Some(stdio.command);
                raw.args = (!stdio.args.is_empty()).then_some(stdio.args);
                raw.env = (!stdio.env.is_empty()).then_some(stdio.env);
                raw.cwd = stdio.cwd.map(|p| p.to_string_lossy().into_owned());
            }
            TransportConfig::Http(http) => {
                if http.mode != HttpTransportMode::infer(&http.url) {
                    raw.transport = Some(match http.mode {
                        HttpTransportMode::Streamable => "streamable-http".to_string(),
                        HttpTransportMode::LegacySse => "sse".to_string(),
                    });
                }
                raw.url = Some(http.url.to_string());
                raw.headers = (!http.headers.is_empty()).then_some(http.headers);
                raw.auth_token = http.auth_token;
            }
        }
        RawServerConfig::Object(raw)
    }
}

// ============================================================================
// LOADING
// ============================================================================

impl Config {
    /// Get limits (with defaults if not configured)
    pub fn get_limits(&self) -> LimitsConfig {
        self.limits.clone().unwrap_or_default()
    }

    /// Get HTTP config (with defaults if not configured)
    pub fn get_http(&self) -> HttpConfig {
        self.http.clone().unwrap_or_default()
    }

    /// Load configuration from the default file
    pub fn load() -> Result<Self> {
        Self::load_from_path(CONFIG_FILE_NAME)
    }

    /// Load configuration from specific path
    ///
    /// A missing file yields the default configuration.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            ScopeError::config(format!(
                "Failed to parse config {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration and apply environment overrides
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load_from_path(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply MCPSCOPE_HOST / MCPSCOPE_PORT / MCPSCOPE_PUBLIC_URL
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        let mut http = self.get_http();
        let mut changed = false;

        if let Ok(host) = env::var(ENV_HOST)
            && !host.is_empty()
        {
            http.host = host;
            changed = true;
        }

        if let Ok(port) = env::var(ENV_PORT)
            && !port.is_empty()
        {
            http.port = port
                .parse()
                .map_err(|e| ScopeError::config(format!("Invalid {} '{}': {}", ENV_PORT, port, e)))?;
            changed = true;
        }

        if let Ok(public_url) = env::var(ENV_PUBLIC_URL)
            && !public_url.is_empty()
        {
            http.public_url = Some(public_url);
            changed = true;
        }

        if changed {
            self.http = Some(http);
        }
        Ok(())
    }

    /// Save configuration to specific path as pretty JSON
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path_ref, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if let Some(ref http) = self.http {
            if http.port == 0 {
                return Err(ScopeError::config("http.port must be nonzero (1-65535)"));
            }

            if http.host.is_empty() {
                return Err(ScopeError::config("http.host cannot be empty"));
            }

            if let Some(ref public_url) = http.public_url
                && !public_url.starts_with("http://")
                && !public_url.starts_with("https://")
            {
                return Err(ScopeError::config(format!(
                    "Invalid http.publicUrl '{}': must start with http:// or https://",
                    public_url
                )));
            }

            if let Some(ref origins) = http.allowed_origins {
                for origin in origins {
                    if !origin.starts_with("http://") && !origin.starts_with("https://") {
                        return Err(ScopeError::config(format!(
                            "Invalid CORS origin '{}': must start with http:// or https://",
                            origin
                        )));
                    }
                }
            }
        }

        if let Some(ref limits) = self.limits {
            if limits.request_timeout_ms == 0 {
                return Err(ScopeError::config(
                    "limits.requestTimeoutMs must be greater than 0",
                ));
            }
            if limits.elicitation_timeout_ms == 0 {
                return Err(ScopeError::config(
                    "limits.elicitationTimeoutMs must be greater than 0",
                ));
            }
            if limits.max_log_entries == 0 {
                return Err(ScopeError::config(
                    "limits.maxLogEntries must be greater than 0",
                ));
            }
        }

        if let Some(ref servers) = self.mcp_servers {
            for name in servers.keys() {
                if name.trim().is_empty() {
                    return Err(ScopeError::config("mcpServers keys cannot be empty"));
                }
            }
        }

        Ok(())
    }

    /// Upsert MCP server configuration
    pub fn upsert_mcp_server(&mut self, name: String, server: ServerConfig) {
        self.mcp_servers
            .get_or_insert_with(HashMap::new)
            .insert(name, server);
    }

    /// Look up a configured server by name
    pub fn mcp_server(&self, name: &str) -> Option<&ServerConfig> {
        self.mcp_servers.as_ref().and_then(|s| s.get(name))
    }
}

#[cfg(test)]
mod config_test;
