#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use hardware_mcp::mcp::{HardwareManager, McpHardwareCommands};
use poem_mcpserver::McpServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // stdout carries the protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let manager = Arc::new(HardwareManager::from_env()?);
    manager.init();

    let served =
        poem_mcpserver::stdio::stdio(McpServer::new().tools(McpHardwareCommands::new(manager.clone())))
            .await;

    manager.shutdown().await;
    served?;
    Ok(())
}
