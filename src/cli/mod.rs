//! Command-line interface for mcpscope
//!
//! `serve` runs the HTTP server; `servers`, `tools` and `call` are one-shot
//! commands that connect, do their work, print JSON and disconnect.

use crate::config::{Config, ServerConfig};
use crate::constants::{CONFIG_FILE_NAME, ENV_CONFIG_PATH};
use crate::mcp::{ManagerOptions, McpManager};
use crate::{Result, ScopeError};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;
use std::sync::Arc;

/// Main CLI entry point
pub async fn run() -> Result<()> {
    let matches = build_cli().get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .cloned()
        .unwrap_or_else(|| CONFIG_FILE_NAME.to_string());
    let config = Config::load_with_env(&config_path)?;

    crate::init_logging(config.log.as_ref().and_then(|l| l.level.as_deref()));
    tracing::debug!("Loaded configuration from {}", config_path);

    match matches.subcommand() {
        Some(("serve", sub)) => handle_serve_command(sub, config).await,
        Some(("servers", _)) => handle_servers_command(&config).await,
        Some(("tools", sub)) => handle_tools_command(sub, &config).await,
        Some(("call", sub)) => handle_call_command(sub, &config).await,
        _ => {
            eprintln!("No command specified. Use --help for usage information.");
            std::process::exit(1);
        }
    }
}

fn build_cli() -> Command {
    Command::new("mcpscope")
        .about("mcpscope - MCP server inspector and interception proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .env(ENV_CONFIG_PATH)
                .help("Path to mcpscope.config.json"),
        )
        .subcommand(
            Command::new("serve")
                .about("Start the inspector HTTP server and proxy")
                .arg(Arg::new("host").long("host").help("Server host"))
                .arg(
                    Arg::new("port")
                        .long("port")
                        .short('p')
                        .value_parser(clap::value_parser!(u16))
                        .help("Server port"),
                )
                .arg(
                    Arg::new("public-url")
                        .long("public-url")
                        .help("Externally visible base URL for minted proxy URLs"),
                ),
        )
        .subcommand(Command::new("servers").about("Connect every configured server and print its status"))
        .subcommand(
            Command::new("tools")
                .about("List a server's tools")
                .arg(
                    Arg::new("server")
                        .required(true)
                        .index(1)
                        .help("Configured server name, or an http(s) URL"),
                ),
        )
        .subcommand(
            Command::new("call")
                .about("Call a tool and print its result")
                .arg(Arg::new("server").required(true).index(1))
                .arg(Arg::new("tool").required(true).index(2))
                .arg(
                    Arg::new("args")
                        .long("args")
                        .short('a')
                        .default_value("{}")
                        .help("Tool arguments as a JSON object"),
                )
                .arg(
                    Arg::new("fail-on-error")
                        .long("fail-on-error")
                        .action(ArgAction::SetTrue)
                        .help("Exit non-zero when the tool reports isError"),
                ),
        )
}

async fn handle_serve_command(matches: &ArgMatches, mut config: Config) -> Result<()> {
    let mut http = config.get_http();
    if let Some(host) = matches.get_one::<String>("host") {
        http.host = host.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        http.port = *port;
    }
    if let Some(public_url) = matches.get_one::<String>("public-url") {
        http.public_url = Some(public_url.clone());
    }
    config.http = Some(http);

    crate::http::start_server(config).await
}

fn manager_for(config: &Config) -> Arc<McpManager> {
    Arc::new(McpManager::new(ManagerOptions::from(&config.get_limits())))
}

/// A configured server, or an ad-hoc one when `name` is a URL
fn resolve_server(config: &Config, name: &str) -> Result<ServerConfig> {
    if let Some(server) = config.mcp_server(name) {
        return Ok(server.clone());
    }
    if name.starts_with("http://") || name.starts_with("https://") {
        return ServerConfig::http(name);
    }
    Err(ScopeError::not_found(format!(
        "MCP server '{}' is not in the configuration",
        name
    )))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_servers_command(config: &Config) -> Result<()> {
    let manager = manager_for(config);
    let mut servers: Vec<_> = config.mcp_servers.clone().unwrap_or_default().into_iter().collect();
    servers.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, server) in servers {
        // failures are reported through the summary's status and lastError
        let _ = manager.connect_to_server(&name, server).await;
    }
    print_json(&manager.list_servers())?;
    manager.disconnect_all_servers().await;
    Ok(())
}

async fn handle_tools_command(matches: &ArgMatches, config: &Config) -> Result<()> {
    let name = matches
        .get_one::<String>("server")
        .ok_or_else(|| ScopeError::validation("server is required"))?;
    let manager = manager_for(config);

    manager
        .connect_to_server(name, resolve_server(config, name)?)
        .await?;
    let result = manager.get_tools(Some(&[name.clone()])).await;
    manager.disconnect_all_servers().await;

    print_json(&result?)
}

async fn handle_call_command(matches: &ArgMatches, config: &Config) -> Result<()> {
    let name = matches
        .get_one::<String>("server")
        .ok_or_else(|| ScopeError::validation("server is required"))?;
    let tool = matches
        .get_one::<String>("tool")
        .ok_or_else(|| ScopeError::validation("tool is required"))?;
    let args: Value = match matches.get_one::<String>("args") {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| ScopeError::validation(format!("--args is not valid JSON: {}", e)))?,
        None => Value::Null,
    };

    let manager = manager_for(config);
    manager
        .connect_to_server(name, resolve_server(config, name)?)
        .await?;
    let result = manager.execute_tool(name, tool, args).await;
    manager.disconnect_all_servers().await;

    let result = result?;
    print_json(&result)?;
    if matches.get_flag("fail-on-error") {
        result.into_result()?;
    }
    Ok(())
}
