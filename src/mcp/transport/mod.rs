//! Remote-execution transport.
//!
//! The broker never talks to SSH directly. It asks a [`Connector`] to open a
//! [`RemoteConnection`] to an endpoint, runs one-shot commands on it, and
//! opens interactive [`ShellChannel`]s for terminal sessions. The production
//! connector is [`SshConnector`], built on russh with key-file authentication.

mod client;
mod handler;
mod shell;

use std::time::Duration;

use async_trait::async_trait;

use crate::mcp::endpoint::Endpoint;
use crate::mcp::error::TransportError;

pub use client::SshConnector;
pub use handler::SshClientHandler;

/// Most shell output held between two drains. Older bytes are dropped first.
pub(crate) const MAX_SHELL_BUFFER: usize = 1024 * 1024;

/// Append `data`, keeping only the newest `limit` bytes.
pub(crate) fn append_bounded(buffer: &mut Vec<u8>, data: &[u8], limit: usize) {
    if data.len() >= limit {
        buffer.clear();
        buffer.extend_from_slice(&data[data.len() - limit..]);
        return;
    }
    let overflow = (buffer.len() + data.len()).saturating_sub(limit);
    if overflow > 0 {
        buffer.drain(..overflow);
    }
    buffer.extend_from_slice(data);
}

/// How a connection will be used, which decides retry and keepalive policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Health probe: single attempt, short inactivity timeout.
    Probe,
    /// Pooled or interactive use: retried with backoff, kept alive.
    Session,
}

/// Output of a one-shot remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server never reported an exit status
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An authenticated connection to one endpoint.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Run a command and collect its output.
    ///
    /// Exceeding `timeout` yields [`TransportError::Timeout`].
    async fn exec(&self, command: &str, timeout: Duration)
    -> Result<CommandOutput, TransportError>;

    /// Open an interactive PTY shell on this connection.
    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>, TransportError>;

    /// Close the connection. Errors are logged, never returned.
    async fn close(&self);
}

/// An interactive shell with a background receive buffer.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Take everything received since the previous call.
    async fn drain(&self) -> Vec<u8>;

    /// True once the remote side closed the channel.
    fn is_closed(&self) -> bool;

    async fn close(&self);
}

/// Opens authenticated connections to endpoints.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        mode: ConnectMode,
    ) -> Result<Box<dyn RemoteConnection>, TransportError>;
}
