//! MCP (Model Context Protocol) client side: transports, connections and
//! the multi-server manager

pub mod connection;
pub mod elicitation;
mod facade;
pub mod http;
pub mod manager;
pub mod stdio;
pub mod transport;

pub use connection::{
    ElicitationHandler, NotificationHandler, ServerBindings, ServerConnection, ToolCallOutcome,
};
pub use elicitation::{ElicitationWaiter, PendingElicitationInfo, PendingElicitations};
pub use manager::{ManagerOptions, McpManager};
pub use transport::Transport;
