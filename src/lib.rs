//! mcpscope - MCP server inspector
//!
//! Two subsystems make up the protocol gateway:
//! - [`mcp::McpManager`] connects to any number of named MCP servers over
//!   stdio or HTTP and exposes their tools, resources and prompts, including
//!   server-initiated notifications and elicitation.
//! - [`interceptor::InterceptorStore`] and the [`proxy`] sit between a client
//!   and a real MCP server, forwarding JSON-RPC/SSE traffic while keeping a
//!   live, replayable log of every exchange.
//!
//! # Example
//!
//! ```rust,no_run
//! use mcpscope::config::ServerConfig;
//! use mcpscope::mcp::McpManager;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> mcpscope::Result<()> {
//!     let manager = McpManager::default();
//!     manager
//!         .connect_to_server("demo", ServerConfig::stdio("mcpscope-demo-server", vec![]))
//!         .await?;
//!
//!     let result = manager
//!         .execute_tool("demo", "add", json!({"a": 1, "b": 2}))
//!         .await?;
//!     println!("{:?}", result.first_text());
//!
//!     manager.disconnect_all_servers().await;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod constants;
pub mod error;
pub mod model;

// Infrastructure
pub mod config;
pub mod sse;
pub mod telemetry;

// MCP client side
pub mod mcp;

// Interception proxy
pub mod interceptor;
pub mod proxy;

// Interface layers
pub mod cli;
pub mod http;

// Utilities
pub mod utils;

// Re-exports for convenience
pub use error::{Result, ScopeError};
pub use interceptor::{InterceptorStore, ProxyLogEntry};
pub use mcp::McpManager;

/// Initialize logging for the application
///
/// `RUST_LOG` wins; otherwise `level` (a bare level applies to this crate,
/// a full directive is used as-is), otherwise `mcpscope=info`. Output goes to
/// stderr so stdout stays clean for piped JSON.
pub fn init_logging(level: Option<&str>) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let fallback = match level {
        Some(level) if level.contains('=') => level.to_string(),
        Some(level) => format!("mcpscope={}", level),
        None => "mcpscope=info".to_string(),
    };

    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
