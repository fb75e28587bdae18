//! SSH connector built on russh.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: inactivity timeout, keepalive and compression.
//! 2. **Connection Establishment**: TCP connect, banner and key exchange,
//!    bounded by the connect timeout.
//! 3. **Authentication**: private key file via [`KeyAuth`], bounded by the
//!    same timeout.
//!
//! ## Retry Strategy
//!
//! [`ConnectMode::Session`] connections use exponential backoff with jitter
//! via the `backon` crate, capped at [`MAX_RETRY_DELAY`]. Authentication and
//! protocol failures are never retried. [`ConnectMode::Probe`] connections
//! make exactly one attempt so health probes measure the endpoint as it is.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use russh::{ChannelMsg, Disconnect, client};
use tracing::{debug, error, info, warn};

use crate::mcp::auth::{AuthStrategy, KeyAuth};
use crate::mcp::config::{MAX_RETRY_DELAY, ManagerConfig};
use crate::mcp::endpoint::Endpoint;
use crate::mcp::error::TransportError;

use super::handler::SshClientHandler;
use super::shell::SshShell;
use super::{CommandOutput, ConnectMode, Connector, RemoteConnection, ShellChannel};

/// Build russh client configuration.
///
/// Persistent connections have no inactivity timeout and rely on keepalives
/// (every 30 seconds, at most 3 unanswered) to detect a dead peer.
pub(crate) fn build_client_config(
    timeout: Duration,
    compress: bool,
    persistent: bool,
) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    let inactivity_timeout = if persistent { None } else { Some(timeout) };

    Arc::new(client::Config {
        inactivity_timeout,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Production [`Connector`] that opens SSH sessions with key authentication.
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
    compression: bool,
    max_retries: u32,
    retry_delay: Duration,
}

impl SshConnector {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            compression: config.compression,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
        }
    }

    async fn connect_with_retry(
        &self,
        endpoint: &Endpoint,
    ) -> Result<client::Handle<SshClientHandler>, TransportError> {
        let attempt_counter = AtomicU32::new(0);
        let target = format!("{}@{}", endpoint.username(), endpoint.key());

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.retry_delay)
            .with_max_delay(MAX_RETRY_DELAY)
            .with_max_times(self.max_retries as usize)
            .with_jitter();

        let result = (|| async {
            let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
            if current_attempt > 0 {
                warn!("SSH connection retry attempt {} to {}", current_attempt, target);
            }
            connect_to_ssh(endpoint, self.connect_timeout, self.compression, true).await
        })
        .retry(backoff)
        .when(|e: &TransportError| {
            let retryable = e.is_retryable();
            if !retryable {
                warn!(
                    "SSH connection to {} failed with non-retryable error: {}",
                    target, e
                );
            }
            retryable
        })
        .notify(|err, dur| {
            warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
        })
        .await;

        let total_attempts = attempt_counter.load(Ordering::SeqCst);
        match result {
            Ok(handle) => {
                if total_attempts > 1 {
                    info!(
                        "SSH connection to {} succeeded after {} retry attempt(s)",
                        target,
                        total_attempts - 1
                    );
                }
                Ok(handle)
            }
            Err(e) => {
                error!(
                    "SSH connection to {} failed after {} attempt(s). Last error: {}",
                    target, total_attempts, e
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        mode: ConnectMode,
    ) -> Result<Box<dyn RemoteConnection>, TransportError> {
        let handle = match mode {
            ConnectMode::Probe => {
                connect_to_ssh(endpoint, self.connect_timeout, self.compression, false).await?
            }
            ConnectMode::Session => self.connect_with_retry(endpoint).await?,
        };

        Ok(Box::new(SshConnection {
            handle,
            label: endpoint.key(),
        }))
    }
}

/// Establish an SSH connection and authenticate with the endpoint's key.
///
/// Connect (including banner and key exchange) and authentication are each
/// bounded by `timeout`.
async fn connect_to_ssh(
    endpoint: &Endpoint,
    timeout: Duration,
    compress: bool,
    persistent: bool,
) -> Result<client::Handle<SshClientHandler>, TransportError> {
    let config = build_client_config(timeout, compress, persistent);
    let connect_future = client::connect(
        config,
        (endpoint.hostname(), endpoint.port()),
        SshClientHandler,
    );

    let mut handle = tokio::time::timeout(timeout, connect_future)
        .await
        .map_err(|_| {
            TransportError::Timeout(format!(
                "Connection to {} timed out after {:?}",
                endpoint.key(),
                timeout
            ))
        })?
        .map_err(|e| {
            TransportError::classify(format!("Failed to connect to {}: {}", endpoint.key(), e))
        })?;

    let auth = KeyAuth::new(endpoint.key_path().clone());
    debug!("Authenticating to {} using {}", endpoint.key(), auth.name());

    let success = tokio::time::timeout(timeout, auth.authenticate(&mut handle, endpoint.username()))
        .await
        .map_err(|_| {
            TransportError::Timeout(format!(
                "Authentication to {} timed out after {:?}",
                endpoint.key(),
                timeout
            ))
        })??;

    if !success {
        return Err(TransportError::Auth(format!(
            "Authentication failed for {}@{}: key rejected",
            endpoint.username(),
            endpoint.key()
        )));
    }

    Ok(handle)
}

/// Authenticated russh session to one endpoint.
struct SshConnection {
    handle: client::Handle<SshClientHandler>,
    label: String,
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn exec(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::classify(format!("Failed to open channel: {}", e)))?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| TransportError::classify(format!("Failed to execute command: {}", e)))?;

        let mut stdout = Vec::with_capacity(4096);
        let mut stderr = Vec::with_capacity(1024);
        let mut exit_code: Option<u32> = None;

        let result = tokio::time::timeout(timeout, async {
            loop {
                match channel.wait().await {
                    Some(ChannelMsg::Data { data }) => {
                        stdout.extend_from_slice(&data);
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        // ext == 1 is stderr in SSH protocol
                        if ext == 1 {
                            stderr.extend_from_slice(&data);
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        exit_code = Some(exit_status);
                    }
                    Some(ChannelMsg::Eof) => {
                        if exit_code.is_some() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                }
            }
        })
        .await;

        let _ = channel.close().await;

        if result.is_err() {
            warn!(
                "Command on {} timed out after {:?} ({} bytes stdout, {} bytes stderr discarded)",
                self.label,
                timeout,
                stdout.len(),
                stderr.len()
            );
            return Err(TransportError::Timeout(
                "Command execution timeout".to_string(),
            ));
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.map(|c| c as i32),
        })
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| TransportError::classify(format!("Failed to open channel: {}", e)))?;

        channel
            .request_pty(false, "xterm", 200, 50, 0, 0, &[])
            .await
            .map_err(|e| TransportError::classify(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| TransportError::classify(format!("Failed to start shell: {}", e)))?;

        debug!("Opened interactive shell on {}", self.label);
        Ok(Box::new(SshShell::spawn(channel)))
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Connection closed by broker", "en")
            .await
        {
            warn!("Error during disconnect from {}: {}", self.label, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod client_config {
        use super::*;

        #[test]
        fn test_builds_config_with_timeout() {
            let config = build_client_config(Duration::from_secs(10), true, false);
            assert_eq!(config.inactivity_timeout, Some(Duration::from_secs(10)));
        }

        #[test]
        fn test_builds_config_with_keepalive() {
            let config = build_client_config(Duration::from_secs(10), true, false);
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }

        #[test]
        fn test_compression_preferences() {
            let enabled = build_client_config(Duration::from_secs(10), true, false);
            let disabled = build_client_config(Duration::from_secs(10), false, false);
            assert!(enabled.preferred.compression.len() > disabled.preferred.compression.len());
        }

        #[test]
        fn test_persistent_disables_inactivity_timeout() {
            let config = build_client_config(Duration::from_secs(10), true, true);
            assert_eq!(config.inactivity_timeout, None);
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
        }
    }

    mod connector {
        use super::*;

        #[test]
        fn test_takes_settings_from_config() {
            let config = ManagerConfig {
                connect_timeout: Duration::from_secs(7),
                max_retries: 1,
                compression: false,
                ..Default::default()
            };
            let connector = SshConnector::new(&config);
            assert_eq!(connector.connect_timeout, Duration::from_secs(7));
            assert_eq!(connector.max_retries, 1);
            assert!(!connector.compression);
        }

        #[tokio::test]
        async fn test_probe_to_closed_port_fails_fast() {
            let config = ManagerConfig {
                connect_timeout: Duration::from_secs(2),
                ..Default::default()
            };
            let connector = SshConnector::new(&config);
            let mut spec = crate::mcp::endpoint::EndpointSpec::new(
                "127.0.0.1",
                "nobody",
                "/nonexistent/key",
            );
            spec.port = 1;
            let endpoint = spec.build().unwrap();

            let result = connector.connect(&endpoint, ConnectMode::Probe).await;
            assert!(result.is_err());
        }
    }
}
