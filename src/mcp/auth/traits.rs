//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::mcp::error::TransportError;
use crate::mcp::transport::SshClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - Credentials rejected by the server
    /// * `Err(_)` - The attempt itself failed (unreadable key, transport error)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError>;

    /// Name used in logs.
    fn name(&self) -> &'static str;
}
