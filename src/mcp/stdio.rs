//! Subprocess transport: newline-delimited JSON-RPC over stdin/stdout

use super::transport::{Inbound, InboundSender, Transport};
use crate::config::{StdioServerConfig, TransportKind};
use crate::model::JsonRpcMessage;
use crate::utils::lookup_env_value;
use crate::{Result, ScopeError};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const KILL_GRACE: Duration = Duration::from_secs(2);

pub struct StdioTransport {
    server_id: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    cancel: CancellationToken,
}

impl StdioTransport {
    /// Spawn the server process and start pumping its stdout into `inbound`
    pub fn spawn(server_id: &str, config: &StdioServerConfig, inbound: InboundSender) -> Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        cmd.envs(child_env(config));
        if let Some(ref cwd) = config.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ScopeError::connection(format!(
                "Failed to spawn MCP server '{}' ({}): {}",
                server_id, config.command, e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ScopeError::connection("Failed to get stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScopeError::connection("Failed to get stdout"))?;
        let stderr = child.stderr.take();

        let cancel = CancellationToken::new();
        tokio::spawn(read_stdout(
            server_id.to_string(),
            stdout,
            inbound,
            cancel.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(server_id.to_string(), stderr, cancel.clone()));
        }

        tracing::debug!(server = %server_id, pid = ?child.id(), "Spawned MCP server process");

        Ok(Self {
            server_id: server_id.to_string(),
            child: Mutex::new(Some(child)),
            stdin: Mutex::new(Some(stdin)),
            cancel,
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            ScopeError::connection(format!("MCP server '{}' is closed", self.server_id))
        })?;

        let write = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        };
        write.await.map_err(|e| {
            ScopeError::connection(format!(
                "Failed to write to MCP server '{}': {}",
                self.server_id, e
            ))
        })
    }

    async fn close(&self) {
        self.cancel.cancel();
        // Dropping stdin signals EOF to well-behaved servers
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_id, %status, "MCP server exited");
            }
            _ => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.server_id, "Failed to kill MCP server: {}", e);
                }
            }
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Variables set on the child on top of the inherited environment
///
/// A `$env:` reference to an unset variable is skipped so the child keeps
/// whatever it inherits.
fn child_env(config: &StdioServerConfig) -> Vec<(String, String)> {
    config
        .env
        .iter()
        .filter_map(|(name, value)| match lookup_env_value(value) {
            Some(expanded) => Some((name.clone(), expanded)),
            None => {
                tracing::debug!(variable = %name, "Skipping unset {} reference", value);
                None
            }
        })
        .collect()
}

async fn read_stdout(
    server_id: String,
    stdout: ChildStdout,
    inbound: InboundSender,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(server = %server_id, "MCP server closed stdout");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server_id, "Failed to read MCP server stdout: {}", e);
                break;
            }
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        // Servers occasionally print diagnostics on stdout; skip non-JSON lines
        let messages = serde_json::from_str::<Value>(trimmed)
            .map_err(ScopeError::from)
            .and_then(JsonRpcMessage::parse_batch);
        match messages {
            Ok(messages) => {
                for message in messages {
                    if inbound.send(Inbound::message(message)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(server = %server_id, "Ignoring non JSON-RPC stdout line: {}", e);
            }
        }
    }
}

async fn forward_stderr(server_id: String, stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => match next {
                Ok(Some(line)) => tracing::debug!(server = %server_id, "stderr: {}", line),
                _ => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_child_env_skips_unset_references() {
        unsafe {
            std::env::set_var("MCPSCOPE_TEST_CHILD_SET", "from-parent");
            std::env::remove_var("MCPSCOPE_TEST_CHILD_UNSET");
        }
        let config = StdioServerConfig {
            command: "server".to_string(),
            args: vec![],
            cwd: None,
            env: HashMap::from([
                ("PLAIN".to_string(), "literal".to_string()),
                ("SET".to_string(), "$env:MCPSCOPE_TEST_CHILD_SET".to_string()),
                ("UNSET".to_string(), "$env:MCPSCOPE_TEST_CHILD_UNSET".to_string()),
            ]),
        };

        let mut env = child_env(&config);
        env.sort();
        assert_eq!(
            env,
            vec![
                ("PLAIN".to_string(), "literal".to_string()),
                ("SET".to_string(), "from-parent".to_string()),
            ]
        );
    }
}
