#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use hardware_mcp::mcp::{HardwareManager, McpHardwareCommands};
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let manager = Arc::new(HardwareManager::from_env()?);
    manager.init();
    info!(
        "Loaded {} hardware endpoint(s), agent mode {}",
        manager.registry().len(),
        if manager.config().agent_mode { "on" } else { "off" }
    );

    // Setup MCP server
    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);
    info!("Starting MCP server on {}", mcp_addr);

    let tools_manager = manager.clone();
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(move |_| {
                McpServer::new().tools(McpHardwareCommands::new(tools_manager.clone()))
            }),
        )
        .with(Tracing);

    info!("MCP Server with hardware access is ready");
    info!("Use the manage_endpoints command to register endpoints");
    info!("Use the connect command to select the best endpoint");

    // Run the MCP server until interrupted
    let served = Server::new(TcpListener::bind(mcp_addr))
        .name("Hardware MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown signal received");
            },
            None,
        )
        .await;

    manager.shutdown().await;
    served?;

    Ok(())
}
