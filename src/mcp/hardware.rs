//! Hardware inspection and the per-host snapshot cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::mcp::endpoint::Endpoint;
use crate::mcp::error::{HardwareError, Result, TransportError};
use crate::mcp::pool::ConnectionPool;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const CPU_COUNT_COMMAND: &str = "nproc";
pub(crate) const MEMORY_COMMAND: &str = "free -g | awk '/^Mem:/{print $2}'";
pub(crate) const GPU_COMMAND: &str =
    "lspci | grep -i vga || lspci | grep -i display || echo \"No GPU detected\"";
pub(crate) const DISK_COMMAND: &str = "df -BG / | awk 'NR==2{print $2}' | sed 's/G//'";
pub(crate) const PLATFORM_COMMAND: &str = "uname -s";
pub(crate) const ARCH_COMMAND: &str = "uname -m";

/// Point-in-time hardware description of one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HardwareSnapshot {
    pub hostname: String,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub cpu_count: u32,
    pub memory_gb: f64,
    pub disk_space_gb: f64,
    /// One entry per display controller line
    pub gpu_info: Vec<String>,
    pub platform: String,
    pub architecture: String,
    pub captured_at: String,
}

/// Raw trimmed outputs of the inspection commands.
#[derive(Debug, Default)]
pub(crate) struct RawInspection {
    pub cpu_count: String,
    pub memory: String,
    pub gpu_info: String,
    pub disk_space: String,
    pub platform: String,
    pub architecture: String,
}

fn parse_number<T: std::str::FromStr>(hostname: &str, field: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        HardwareError::Transport(TransportError::Protocol(format!(
            "Unexpected {} output from {}: {:?}",
            field, hostname, raw
        )))
    })
}

fn text_or_unknown(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build a snapshot from raw command output.
pub(crate) fn parse_snapshot(hostname: &str, raw: &RawInspection) -> Result<HardwareSnapshot> {
    Ok(HardwareSnapshot {
        hostname: hostname.to_string(),
        cpu_count: parse_number(hostname, "cpu count", &raw.cpu_count)?,
        memory_gb: parse_number(hostname, "memory", &raw.memory)?,
        disk_space_gb: parse_number(hostname, "disk space", &raw.disk_space)?,
        gpu_info: raw
            .gpu_info
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect(),
        platform: text_or_unknown(&raw.platform),
        architecture: text_or_unknown(&raw.architecture),
        captured_at: Utc::now().to_rfc3339(),
    })
}

pub struct HardwareInspector {
    pool: Arc<ConnectionPool>,
    cache: DashMap<String, HardwareSnapshot>,
}

impl HardwareInspector {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            cache: DashMap::new(),
        }
    }

    pub fn cached(&self, hostname: &str) -> Option<HardwareSnapshot> {
        self.cache.get(hostname).map(|e| e.value().clone())
    }

    /// Cached snapshot unless `refresh` is set or none exists.
    ///
    /// The flag in the result tells whether the snapshot came from the cache.
    pub async fn snapshot(&self, endpoint: &Endpoint, refresh: bool) -> Result<(HardwareSnapshot, bool)> {
        if !refresh && let Some(snapshot) = self.cached(endpoint.hostname()) {
            return Ok((snapshot, true));
        }
        Ok((self.inspect(endpoint).await?, false))
    }

    /// Collect a fresh snapshot over one pooled connection and replace the
    /// cached one.
    pub async fn inspect(&self, endpoint: &Endpoint) -> Result<HardwareSnapshot> {
        let pooled = self.pool.acquire(endpoint).await?;
        let conn = pooled.connection();

        let mut outputs = Vec::with_capacity(6);
        for command in [
            CPU_COUNT_COMMAND,
            MEMORY_COMMAND,
            GPU_COMMAND,
            DISK_COMMAND,
            PLATFORM_COMMAND,
            ARCH_COMMAND,
        ] {
            match conn.exec(command, INSPECT_TIMEOUT).await {
                Ok(output) => outputs.push(output.stdout.trim().to_string()),
                Err(e) => {
                    warn!("Hardware inspection of {} failed: {}", endpoint.key(), e);
                    self.pool.release(pooled).await;
                    return Err(e.into());
                }
            }
        }
        self.pool.release(pooled).await;

        let mut outputs = outputs.into_iter();
        let mut next = || outputs.next().unwrap_or_default();
        let raw = RawInspection {
            cpu_count: next(),
            memory: next(),
            gpu_info: next(),
            disk_space: next(),
            platform: next(),
            architecture: next(),
        };

        let snapshot = parse_snapshot(endpoint.hostname(), &raw)?;
        info!(
            "Hardware of {}: {} CPU(s), {} GB RAM, {} GPU line(s)",
            endpoint.hostname(),
            snapshot.cpu_count,
            snapshot.memory_gb,
            snapshot.gpu_info.len()
        );
        self.cache
            .insert(endpoint.hostname().to_string(), snapshot.clone());
        Ok(snapshot)
    }
}
