//! Typed MCP operations on top of [`McpManager`]
//!
//! Every call resolves the named connection, sends one JSON-RPC request and
//! decodes the result into the model types.

use super::manager::McpManager;
use crate::constants::{
    METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCE_TEMPLATES_LIST, METHOD_RESOURCES_LIST,
    METHOD_RESOURCES_READ, METHOD_RESOURCES_SUBSCRIBE, METHOD_RESOURCES_UNSUBSCRIBE,
    METHOD_TOOLS_LIST,
};
use crate::model::{
    CallToolResult, ConnectionStatus, GetPromptResult, ListPromptsResult, ListResourceTemplatesResult,
    ListResourcesResult, ListToolsResult, ReadResourceResult, ServerCapabilities, ServerTool,
};
use crate::{Result, ScopeError};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

/// Upper bound on pages followed by `get_tools`
const MAX_TOOL_PAGES: usize = 100;

fn cursor_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|c| json!({ "cursor": c }))
}

impl McpManager {
    async fn call<T: DeserializeOwned>(&self, server: &str, method: &str, params: Option<Value>) -> Result<T> {
        let connection = self.connection(server)?;
        let value = connection.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    fn supports(&self, server: &str, check: impl Fn(&ServerCapabilities) -> bool) -> bool {
        self.get_client(server)
            .and_then(|c| c.capabilities())
            .map(|caps| check(&caps))
            .unwrap_or(true)
    }

    /// One page of a server's tools
    pub async fn list_tools(&self, server: &str, cursor: Option<&str>) -> Result<ListToolsResult> {
        self.call(server, METHOD_TOOLS_LIST, cursor_params(cursor)).await
    }

    /// Every tool from the given servers (or all connected servers), each
    /// tagged with its server id
    ///
    /// Pagination cursors are followed to the end. With an explicit list an
    /// unknown or unusable server is an error; when listing everything,
    /// servers that are not connected are skipped.
    pub async fn get_tools(&self, server_ids: Option<&[String]>) -> Result<Vec<ServerTool>> {
        let targets: Vec<String> = match server_ids {
            Some(ids) => ids.to_vec(),
            None => self
                .list_servers()
                .into_iter()
                .filter(|s| s.status == ConnectionStatus::Connected)
                .map(|s| s.id)
                .collect(),
        };

        let mut tools = Vec::new();
        for server_id in targets {
            let mut cursor: Option<String> = None;
            for _ in 0..MAX_TOOL_PAGES {
                let page = self.list_tools(&server_id, cursor.as_deref()).await?;
                tools.extend(page.tools.into_iter().map(|tool| ServerTool {
                    server_id: server_id.clone(),
                    tool,
                }));
                match page.next_cursor {
                    Some(next) if !next.is_empty() && Some(&next) != cursor.as_ref() => cursor = Some(next),
                    _ => break,
                }
            }
        }
        Ok(tools)
    }

    /// Invoke a tool
    ///
    /// If an elicitation this call triggered expired unanswered, the failure
    /// surfaces as [`ScopeError::ElicitationTimeout`] rather than whatever the
    /// server made of it. An expiry that can't be tied to this call (several
    /// tool calls in flight, nothing correlating them) leaves the result as is.
    pub async fn execute_tool(&self, server: &str, tool_name: &str, arguments: Value) -> Result<CallToolResult> {
        let connection = self.connection(server)?;
        let arguments = match arguments {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };

        let outcome = connection
            .call_tool(json!({ "name": tool_name, "arguments": arguments }))
            .await;
        let elicitation_expired = outcome.elicitation_expired;

        let elicitation_error = || {
            ScopeError::ElicitationTimeout(format!(
                "tool '{}' on '{}' needed user input that never arrived",
                tool_name, server
            ))
        };

        match outcome.result {
            Ok(value) => {
                let result: CallToolResult = serde_json::from_value(value)?;
                if result.is_error && elicitation_expired {
                    return Err(elicitation_error());
                }
                Ok(result)
            }
            Err(ScopeError::Protocol { .. }) if elicitation_expired => Err(elicitation_error()),
            Err(e) => Err(e),
        }
    }

    pub async fn list_resources(&self, server: &str, cursor: Option<&str>) -> Result<ListResourcesResult> {
        if !self.supports(server, |caps| caps.resources.is_some()) {
            return Ok(ListResourcesResult::default());
        }
        self.call(server, METHOD_RESOURCES_LIST, cursor_params(cursor)).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ReadResourceResult> {
        self.call(server, METHOD_RESOURCES_READ, Some(json!({ "uri": uri }))).await
    }

    /// Ask for `notifications/resources/updated` on a URI
    pub async fn subscribe_resource(&self, server: &str, uri: &str) -> Result<()> {
        if !self.supports(server, |caps| caps.supports_resource_subscribe()) {
            return Err(ScopeError::validation(format!(
                "MCP server '{}' does not support resource subscriptions",
                server
            )));
        }
        let _: Value = self
            .call(server, METHOD_RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn unsubscribe_resource(&self, server: &str, uri: &str) -> Result<()> {
        let _: Value = self
            .call(server, METHOD_RESOURCES_UNSUBSCRIBE, Some(json!({ "uri": uri })))
            .await?;
        Ok(())
    }

    pub async fn list_resource_templates(
        &self,
        server: &str,
        cursor: Option<&str>,
    ) -> Result<ListResourceTemplatesResult> {
        if !self.supports(server, |caps| caps.resources.is_some()) {
            return Ok(ListResourceTemplatesResult::default());
        }
        self.call(server, METHOD_RESOURCE_TEMPLATES_LIST, cursor_params(cursor))
            .await
    }

    pub async fn list_prompts(&self, server: &str, cursor: Option<&str>) -> Result<ListPromptsResult> {
        if !self.supports(server, |caps| caps.prompts.is_some()) {
            return Ok(ListPromptsResult::default());
        }
        self.call(server, METHOD_PROMPTS_LIST, cursor_params(cursor)).await
    }

    /// Render a prompt; argument values are sent as strings
    pub async fn get_prompt(&self, server: &str, name: &str, arguments: Option<Value>) -> Result<GetPromptResult> {
        let mut params = json!({ "name": name });
        if let Some(Value::Object(args)) = arguments {
            let stringified: Map<String, Value> = args
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => Value::String(s),
                        other => Value::String(other.to_string()),
                    };
                    (k, v)
                })
                .collect();
            params["arguments"] = Value::Object(stringified);
        }
        self.call(server, METHOD_PROMPTS_GET, Some(params)).await
    }
}
