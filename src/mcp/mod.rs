//! MCP hardware module providing endpoint management and remote command execution.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error types and transport error classification
//! - `security`: Command, hostname, path and key validation, plus the security log
//! - `rate_limit`: Sliding-window request limiting
//! - `endpoint` / `registry`: Endpoint records and their persisted registry
//! - `auth` / `transport`: SSH authentication and the connection seam
//! - `pool`: Per-endpoint connection reuse with capacity slots
//! - `health` / `failover`: Endpoint probing and active endpoint selection
//! - `executor`: One-shot command execution
//! - `terminal`: Persistent interactive sessions
//! - `hardware`: Hardware inspection and caching
//! - `templates`: Command builders for the higher-level tools
//! - `manager`: Composition root owning every component
//! - `commands`: MCP tool implementations

pub(crate) mod auth;
pub mod commands;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod failover;
pub mod hardware;
pub mod health;
pub mod manager;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub(crate) mod schema;
pub mod security;
pub(crate) mod templates;
pub mod terminal;
#[cfg(test)]
pub(crate) mod testing;
pub mod transport;
pub mod types;

pub use commands::McpHardwareCommands;
pub use config::ManagerConfig;
pub use error::{HardwareError, Result};
pub use manager::HardwareManager;
