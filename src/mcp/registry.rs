//! Endpoint registry: the authoritative list of candidate endpoints.
//!
//! The registry is the only owner of [`Endpoint`] values. Health updates
//! and connection-slot accounting go through short synchronous critical
//! sections, so no lock is ever held across an `.await`.
//!
//! # Persistence
//!
//! The registry is stored as a JSON document:
//!
//! ```json
//! { "endpoints": [ { "hostname": "...", "username": "...", "private_key_path": "..." } ],
//!   "last_updated": "2025-01-01T00:00:00Z" }
//! ```
//!
//! Each endpoint record enumerates its accepted fields explicitly. Records
//! with unknown fields, bad timestamps, or values that fail endpoint
//! validation are skipped and logged; the rest of the document still loads.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::mcp::endpoint::{
    DEFAULT_MAX_CONNECTIONS, DEFAULT_PLATFORM, DEFAULT_SSH_PORT, Endpoint, EndpointPurpose,
    EndpointSpec, EndpointStatus,
};
use crate::mcp::error::{HardwareError, Result};

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_platform() -> String {
    DEFAULT_PLATFORM.to_string()
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

/// Persisted form of a single endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct EndpointRecord {
    hostname: String,
    username: String,
    private_key_path: PathBuf,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_platform")]
    platform: String,
    #[serde(default)]
    purpose: EndpointPurpose,
    #[serde(default)]
    status: EndpointStatus,
    #[serde(default)]
    response_time: Option<f64>,
    #[serde(default)]
    last_tested: Option<String>,
    #[serde(default)]
    created: Option<String>,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
    /// Accepted for compatibility, never trusted on load
    #[serde(default)]
    current_connections: usize,
    #[serde(default)]
    tunnel_id: Option<String>,
}

impl EndpointRecord {
    fn from_endpoint(ep: &Endpoint) -> Self {
        Self {
            hostname: ep.hostname().to_string(),
            username: ep.username().to_string(),
            private_key_path: ep.key_path().clone(),
            port: ep.port(),
            platform: ep.platform().to_string(),
            purpose: ep.purpose(),
            status: ep.status(),
            response_time: ep.response_time(),
            last_tested: ep.last_tested().map(|t| t.to_rfc3339()),
            created: Some(ep.created().to_rfc3339()),
            max_connections: ep.max_connections(),
            current_connections: ep.current_connections(),
            tunnel_id: ep.tunnel_id().map(str::to_string),
        }
    }

    fn into_endpoint(self) -> Result<Endpoint> {
        let last_tested = self.last_tested.as_deref().map(parse_timestamp).transpose()?;
        let created = self.created.as_deref().map(parse_timestamp).transpose()?;

        let mut endpoint = EndpointSpec {
            hostname: self.hostname,
            username: self.username,
            key_path: self.private_key_path,
            port: self.port,
            platform: self.platform,
            purpose: self.purpose,
            max_connections: self.max_connections,
            tunnel_id: self.tunnel_id,
        }
        .build()?;

        endpoint.status = self.status;
        endpoint.response_time = self.response_time;
        endpoint.last_tested = last_tested;
        if let Some(created) = created {
            endpoint.created = created;
        }
        Ok(endpoint)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    endpoints: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated: Option<String>,
}

/// Parse an ISO-8601 timestamp. Offsets are honored; naive values are read as UTC.
pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    value
        .parse::<NaiveDateTime>()
        .map(|naive| naive.and_utc())
        .map_err(|e| HardwareError::Persistence(format!("Invalid timestamp '{}': {}", value, e)))
}

/// In-memory endpoint list with optional JSON persistence.
pub struct EndpointRegistry {
    endpoints: RwLock<Vec<Endpoint>>,
    path: Option<PathBuf>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointRegistry {
    /// Create an empty registry that is never persisted.
    pub fn new() -> Self {
        Self {
            endpoints: RwLock::new(Vec::new()),
            path: None,
        }
    }

    /// Load the registry from `path`. A missing file yields an empty registry
    /// that will be written to `path` on the first save.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let endpoints = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| {
                HardwareError::Configuration(format!(
                    "Failed to read registry {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let endpoints = Self::parse_document(&raw)?;
            info!(
                "Loaded {} endpoint(s) from {}",
                endpoints.len(),
                path.display()
            );
            endpoints
        } else {
            info!(
                "Registry {} not found, starting with no endpoints",
                path.display()
            );
            Vec::new()
        };

        Ok(Self {
            endpoints: RwLock::new(endpoints),
            path: Some(path),
        })
    }

    fn parse_document(raw: &str) -> Result<Vec<Endpoint>> {
        let document: RegistryDocument = serde_json::from_str(raw).map_err(|e| {
            HardwareError::Configuration(format!("Malformed registry document: {}", e))
        })?;

        let mut endpoints: Vec<Endpoint> = Vec::with_capacity(document.endpoints.len());
        for (index, value) in document.endpoints.into_iter().enumerate() {
            let parsed = serde_json::from_value::<EndpointRecord>(value)
                .map_err(|e| HardwareError::Persistence(e.to_string()))
                .and_then(EndpointRecord::into_endpoint);

            match parsed {
                Ok(endpoint) if endpoints.iter().any(|e| e.key() == endpoint.key()) => {
                    warn!(
                        "Skipping duplicate endpoint record {} ({})",
                        index,
                        endpoint.key()
                    );
                }
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => error!("Skipping invalid endpoint record {}: {}", index, e),
            }
        }
        Ok(endpoints)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Endpoint>> {
        self.endpoints.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Endpoint>> {
        self.endpoints.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Register a new endpoint. Fails if its `host:port` key is taken.
    pub fn add(&self, endpoint: Endpoint) -> Result<()> {
        let mut endpoints = self.write();
        let key = endpoint.key();
        if endpoints.iter().any(|e| e.key() == key) {
            return Err(HardwareError::EndpointExists(key));
        }
        info!("Registered endpoint {}", key);
        endpoints.push(endpoint);
        Ok(())
    }

    /// Remove an endpoint by key or hostname.
    pub fn remove(&self, key_or_hostname: &str) -> Result<Endpoint> {
        let mut endpoints = self.write();
        let index = endpoints
            .iter()
            .position(|e| e.key() == key_or_hostname || e.hostname() == key_or_hostname)
            .ok_or_else(|| HardwareError::EndpointNotFound(key_or_hostname.to_string()))?;
        let removed = endpoints.remove(index);
        info!("Removed endpoint {}", removed.key());
        Ok(removed)
    }

    /// Snapshot of all endpoints in registration order.
    pub fn list(&self) -> Vec<Endpoint> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Endpoint> {
        self.read().iter().find(|e| e.key() == key).cloned()
    }

    /// Look up by key first, then by hostname.
    pub fn find(&self, key_or_hostname: &str) -> Option<Endpoint> {
        let endpoints = self.read();
        endpoints
            .iter()
            .find(|e| e.key() == key_or_hostname)
            .or_else(|| endpoints.iter().find(|e| e.hostname() == key_or_hostname))
            .cloned()
    }

    /// Set the status of an endpoint, returning the previous one.
    pub fn set_status(&self, key: &str, status: EndpointStatus) -> Option<EndpointStatus> {
        let mut endpoints = self.write();
        let endpoint = endpoints.iter_mut().find(|e| e.key() == key)?;
        Some(std::mem::replace(&mut endpoint.status, status))
    }

    /// Record a finished probe. A failed probe keeps the last good response time.
    pub fn record_probe(&self, key: &str, response_time: Option<f64>) {
        let mut endpoints = self.write();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.key() == key) {
            endpoint.last_tested = Some(Utc::now());
            match response_time {
                Some(elapsed) => {
                    endpoint.status = EndpointStatus::Active;
                    endpoint.response_time = Some(elapsed);
                }
                None => endpoint.status = EndpointStatus::Failed,
            }
        }
    }

    /// Atomically check capacity and take one connection slot.
    pub fn try_reserve_slot(&self, key: &str) -> Result<()> {
        let mut endpoints = self.write();
        let endpoint = endpoints
            .iter_mut()
            .find(|e| e.key() == key)
            .ok_or_else(|| HardwareError::EndpointNotFound(key.to_string()))?;

        if endpoint.current_connections >= endpoint.max_connections() {
            return Err(HardwareError::Connection(format!(
                "Connection pool exhausted for {} ({}/{})",
                key,
                endpoint.current_connections,
                endpoint.max_connections()
            )));
        }
        endpoint.current_connections += 1;
        Ok(())
    }

    /// Give back one connection slot. Never drops below zero.
    pub fn release_slot(&self, key: &str) {
        let mut endpoints = self.write();
        if let Some(endpoint) = endpoints.iter_mut().find(|e| e.key() == key) {
            endpoint.current_connections = endpoint.current_connections.saturating_sub(1);
        }
    }

    /// Write the registry to its path, if it has one.
    ///
    /// The document is written to a temporary file and renamed into place.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let records: Vec<serde_json::Value> = self
            .read()
            .iter()
            .map(EndpointRecord::from_endpoint)
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| HardwareError::Persistence(e.to_string()))?;

        let document = RegistryDocument {
            endpoints: records,
            last_updated: Some(Utc::now().to_rfc3339()),
        };
        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| HardwareError::Persistence(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| {
            HardwareError::Persistence(format!("Failed to write {}: {}", tmp.display(), e))
        })?;
        fs::rename(&tmp, path).map_err(|e| {
            HardwareError::Persistence(format!("Failed to replace {}: {}", path.display(), e))
        })?;
        Ok(())
    }
}
