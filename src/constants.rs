//! Constants used throughout mcpscope
//!
//! Protocol identifiers, default limits, and the header/user-agent tables the
//! proxy consults.

use std::time::Duration;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "mcpscope.config.json";

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 6274;

/// Default HTTP bind host
pub const DEFAULT_HTTP_HOST: &str = "127.0.0.1";

/// Environment variable: config file path
pub const ENV_CONFIG_PATH: &str = "MCPSCOPE_CONFIG";

/// Environment variable: bind host override
pub const ENV_HOST: &str = "MCPSCOPE_HOST";

/// Environment variable: bind port override
pub const ENV_PORT: &str = "MCPSCOPE_PORT";

/// Environment variable: externally visible base URL
pub const ENV_PUBLIC_URL: &str = "MCPSCOPE_PUBLIC_URL";

/// Prefix marking a config value that should be read from the environment
pub const ENV_VALUE_PREFIX: &str = "$env:";

// ============================================================================
// MCP PROTOCOL
// ============================================================================

/// Protocol version offered during the initialize handshake
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";

/// Client name announced in `clientInfo`
pub const CLIENT_NAME: &str = "mcpscope";

/// Session header used by the streamable HTTP transport
pub const HEADER_MCP_SESSION_ID: &str = "mcp-session-id";

/// Protocol version header sent after the handshake
pub const HEADER_MCP_PROTOCOL_VERSION: &str = "mcp-protocol-version";

/// Default request timeout (60s)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// Default window for answering an elicitation (45s, below the request timeout)
pub const DEFAULT_ELICITATION_TIMEOUT_MS: u64 = 45_000;

/// How long the legacy SSE transport waits for its `endpoint` event
pub const LEGACY_SSE_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on delivering `notifications/cancelled` after a timeout
pub const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// JSON-RPC: method not found
pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC: internal error
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

/// Error code returned to a server whose elicitation went unanswered
pub const JSONRPC_ELICITATION_TIMEOUT: i64 = -32001;

// Methods
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";
pub const METHOD_PING: &str = "ping";
pub const METHOD_ROOTS_LIST: &str = "roots/list";
pub const METHOD_ELICITATION_CREATE: &str = "elicitation/create";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";
pub const METHOD_RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
pub const METHOD_RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
pub const METHOD_RESOURCE_TEMPLATES_LIST: &str = "resources/templates/list";
pub const METHOD_PROMPTS_LIST: &str = "prompts/list";
pub const METHOD_PROMPTS_GET: &str = "prompts/get";

// Notifications
pub const NOTIFICATION_RESOURCE_LIST_CHANGED: &str = "notifications/resources/list_changed";
pub const NOTIFICATION_RESOURCE_UPDATED: &str = "notifications/resources/updated";
pub const NOTIFICATION_PROMPT_LIST_CHANGED: &str = "notifications/prompts/list_changed";
pub const NOTIFICATION_TOOL_LIST_CHANGED: &str = "notifications/tools/list_changed";

// ============================================================================
// INTERCEPTION PROXY
// ============================================================================

/// Default number of log entries retained per interceptor entry
pub const DEFAULT_MAX_LOG_ENTRIES: usize = 1000;

/// Logged bodies are truncated past this size
pub const MAX_BODY_CAPTURE_BYTES: usize = 512 * 1024;

/// Longest SSE line buffered while waiting for its terminator
pub const SSE_MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Keepalive period for synthetic SSE streams
pub const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Connect timeout for upstream requests (bodies may stream indefinitely)
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Headers that must never be forwarded by a proxy
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
];

/// Headers recomputed by the proxy itself
pub const RECOMPUTED_HEADERS: &[&str] = &["content-length", "host"];

/// User-agent substrings of clients that reject the JSON `{url}` endpoint form
pub const STRING_ENDPOINT_ONLY_USER_AGENTS: &[&str] =
    &["python-httpx", "python-requests", "mcp-python"];

/// Methods advertised in CORS responses
pub const CORS_ALLOWED_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";

/// Headers advertised in CORS responses
pub const CORS_ALLOWED_HEADERS: &str =
    "Content-Type, Authorization, Accept, Mcp-Session-Id, Mcp-Protocol-Version, Last-Event-ID";

/// Headers browsers may read from proxied responses
pub const CORS_EXPOSED_HEADERS: &str = "Mcp-Session-Id, Mcp-Protocol-Version";

/// Content types treated as streams (never buffered for logging)
pub const STREAMING_CONTENT_TYPES: &[&str] = &["text/event-stream", "application/x-ndjson"];

/// Placeholder body logged for streaming responses
pub const STREAM_PLACEHOLDER: &str = "[streaming response]";

/// Route prefix for the interceptor management API
pub const INTERCEPTOR_API_PREFIX: &str = "/api/mcp/interceptor";

/// Route prefix for the forwarding endpoint
pub const PROXY_ROUTE_PREFIX: &str = "/proxy";
