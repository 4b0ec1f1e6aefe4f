//! mcpscope CLI - MCP server inspector
//!
//! Run with: cargo run --bin mcpscope -- <command>
//! Or after build: ./target/release/mcpscope <command>

#[tokio::main]
async fn main() {
    // Load .env before the config so $env: references resolve
    let _ = dotenvy::dotenv();

    if let Err(e) = mcpscope::cli::run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
