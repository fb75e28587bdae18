//! Private key file SSH authentication.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::mcp::error::TransportError;
use crate::mcp::transport::SshClientHandler;

use super::traits::AuthStrategy;

/// Private key file authentication strategy.
///
/// Only passphrase-less keys are supported; an encrypted key fails to load
/// and is reported as an authentication error.
pub struct KeyAuth {
    key_path: PathBuf,
}

impl KeyAuth {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, TransportError> {
        let key_pair = keys::load_secret_key(&self.key_path, None).map_err(|e| {
            TransportError::Auth(format!(
                "Failed to load private key from {}: {}",
                self.key_path.display(),
                e
            ))
        })?;

        // RSA keys need the strongest hash the server accepts
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| TransportError::classify(format!("Key authentication error: {}", e)))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
