//! Endpoint model.
//!
//! An [`Endpoint`] can only be built through [`Endpoint::new`] or
//! [`EndpointSpec::build`], both of which validate the hostname, port and
//! credentials, so an invalid endpoint never exists.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::mcp::error::{HardwareError, Result, SecurityError};
use crate::mcp::security::check_hostname;

pub(crate) const DEFAULT_SSH_PORT: u16 = 22;
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 5;
pub(crate) const DEFAULT_PLATFORM: &str = "unknown";

/// Last known health of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    #[default]
    Unknown,
    Testing,
    Active,
    Failed,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointStatus::Unknown => write!(f, "unknown"),
            EndpointStatus::Testing => write!(f, "testing"),
            EndpointStatus::Active => write!(f, "active"),
            EndpointStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Role of an endpoint in failover.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointPurpose {
    #[default]
    Primary,
    Backup,
    #[serde(alias = "load_balance")]
    LoadBalance,
}

impl FromStr for EndpointPurpose {
    type Err = HardwareError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "primary" => Ok(EndpointPurpose::Primary),
            "backup" => Ok(EndpointPurpose::Backup),
            "load-balance" | "loadbalance" => Ok(EndpointPurpose::LoadBalance),
            other => Err(HardwareError::Configuration(format!(
                "Unknown endpoint purpose: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for EndpointPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointPurpose::Primary => write!(f, "primary"),
            EndpointPurpose::Backup => write!(f, "backup"),
            EndpointPurpose::LoadBalance => write!(f, "load-balance"),
        }
    }
}

/// Unvalidated endpoint description, as received from a tool call or a
/// persisted record.
#[derive(Debug, Clone)]
pub struct EndpointSpec {
    pub hostname: String,
    pub username: String,
    pub key_path: PathBuf,
    pub port: u16,
    pub platform: String,
    pub purpose: EndpointPurpose,
    pub max_connections: usize,
    pub tunnel_id: Option<String>,
}

impl EndpointSpec {
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
            key_path: key_path.into(),
            port: DEFAULT_SSH_PORT,
            platform: DEFAULT_PLATFORM.to_string(),
            purpose: EndpointPurpose::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            tunnel_id: None,
        }
    }

    pub fn build(self) -> Result<Endpoint> {
        check_hostname(&self.hostname)?;
        if self.username.trim().is_empty() {
            return Err(HardwareError::Configuration(
                "Endpoint username cannot be empty".to_string(),
            ));
        }
        if self.key_path.as_os_str().is_empty() {
            return Err(SecurityError::InvalidKey("key path cannot be empty".to_string()).into());
        }
        if self.port == 0 {
            return Err(HardwareError::Configuration(
                "Endpoint port must be between 1 and 65535".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(HardwareError::Configuration(
                "Endpoint max_connections must be at least 1".to_string(),
            ));
        }

        Ok(Endpoint {
            hostname: self.hostname,
            username: self.username,
            key_path: self.key_path,
            port: self.port,
            platform: self.platform,
            purpose: self.purpose,
            status: EndpointStatus::Unknown,
            response_time: None,
            last_tested: None,
            created: Utc::now(),
            max_connections: self.max_connections,
            current_connections: 0,
            tunnel_id: self.tunnel_id,
        })
    }
}

/// A registered remote host.
///
/// Health fields are mutated by the registry on behalf of the health
/// checker, and `current_connections` on behalf of the connection pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    hostname: String,
    username: String,
    key_path: PathBuf,
    port: u16,
    platform: String,
    purpose: EndpointPurpose,
    pub(crate) status: EndpointStatus,
    pub(crate) response_time: Option<f64>,
    pub(crate) last_tested: Option<DateTime<Utc>>,
    pub(crate) created: DateTime<Utc>,
    max_connections: usize,
    pub(crate) current_connections: usize,
    tunnel_id: Option<String>,
}

impl Endpoint {
    /// Create an endpoint with default port, platform and purpose.
    pub fn new(
        hostname: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        EndpointSpec::new(hostname, username, key_path).build()
    }

    /// Registry key, `host:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn key_path(&self) -> &PathBuf {
        &self.key_path
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn purpose(&self) -> EndpointPurpose {
        self.purpose
    }

    pub fn status(&self) -> EndpointStatus {
        self.status
    }

    /// Last measured probe round trip, in seconds.
    pub fn response_time(&self) -> Option<f64> {
        self.response_time
    }

    pub fn last_tested(&self) -> Option<DateTime<Utc>> {
        self.last_tested
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections
    }

    pub fn tunnel_id(&self) -> Option<&str> {
        self.tunnel_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.status == EndpointStatus::Active
    }

    pub fn summary(&self) -> EndpointSummary {
        EndpointSummary {
            key: self.key(),
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            port: self.port,
            platform: self.platform.clone(),
            purpose: self.purpose,
            status: self.status,
            response_time: self.response_time,
            last_tested: self.last_tested.map(|t| t.to_rfc3339()),
            created: self.created.to_rfc3339(),
            max_connections: self.max_connections,
            current_connections: self.current_connections,
            tunnel_id: self.tunnel_id.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_health(mut self, status: EndpointStatus, response_time: Option<f64>) -> Self {
        self.status = status;
        self.response_time = response_time;
        self
    }
}

/// Serializable view of an endpoint for tool responses. Never carries the key path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EndpointSummary {
    pub key: String,
    pub hostname: String,
    pub username: String,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub port: u16,
    pub platform: String,
    pub purpose: EndpointPurpose,
    pub status: EndpointStatus,
    /// Last probe round trip in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested: Option<String>,
    pub created: String,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub max_connections: usize,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub current_connections: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    mod construction {
        use super::*;

        #[test]
        fn test_defaults() {
            let ep = Endpoint::new("gpu01.example.com", "ubuntu", "/keys/id_ed25519").unwrap();
            assert_eq!(ep.port(), 22);
            assert_eq!(ep.platform(), "unknown");
            assert_eq!(ep.purpose(), EndpointPurpose::Primary);
            assert_eq!(ep.status(), EndpointStatus::Unknown);
            assert_eq!(ep.max_connections(), 5);
            assert_eq!(ep.current_connections(), 0);
            assert_eq!(ep.key(), "gpu01.example.com:22");
        }

        #[test]
        fn test_invalid_hostname_fails() {
            let result = Endpoint::new("bad;host", "ubuntu", "/keys/id");
            assert!(matches!(
                result,
                Err(HardwareError::Security(SecurityError::InvalidHostname(_)))
            ));
        }

        #[test]
        fn test_zero_port_fails() {
            let mut spec = EndpointSpec::new("host", "ubuntu", "/keys/id");
            spec.port = 0;
            assert!(spec.build().is_err());
        }

        #[test]
        fn test_empty_username_fails() {
            assert!(Endpoint::new("host", " ", "/keys/id").is_err());
        }

        #[test]
        fn test_empty_key_path_fails() {
            assert!(Endpoint::new("host", "ubuntu", "").is_err());
        }

        #[test]
        fn test_zero_max_connections_fails() {
            let mut spec = EndpointSpec::new("host", "ubuntu", "/keys/id");
            spec.max_connections = 0;
            assert!(spec.build().is_err());
        }

        #[test]
        fn test_custom_port_in_key() {
            let mut spec = EndpointSpec::new("tunnel.example.com", "dev", "/keys/id");
            spec.port = 2222;
            assert_eq!(spec.build().unwrap().key(), "tunnel.example.com:2222");
        }
    }

    mod purpose {
        use super::*;

        #[test]
        fn test_parse() {
            assert_eq!(
                "primary".parse::<EndpointPurpose>().unwrap(),
                EndpointPurpose::Primary
            );
            assert_eq!(
                "load_balance".parse::<EndpointPurpose>().unwrap(),
                EndpointPurpose::LoadBalance
            );
            assert!("mirror".parse::<EndpointPurpose>().is_err());
        }

        #[test]
        fn test_display_values_parse_back() {
            for purpose in [
                EndpointPurpose::Primary,
                EndpointPurpose::Backup,
                EndpointPurpose::LoadBalance,
            ] {
                assert_eq!(purpose.to_string().parse::<EndpointPurpose>().unwrap(), purpose);
            }
            assert!("development".parse::<EndpointPurpose>().is_err());
            assert!("production".parse::<EndpointPurpose>().is_err());
        }

        #[test]
        fn test_serialization() {
            assert_eq!(
                serde_json::to_string(&EndpointPurpose::LoadBalance).unwrap(),
                "\"load-balance\""
            );
            assert_eq!(
                serde_json::to_string(&EndpointStatus::Active).unwrap(),
                "\"active\""
            );
        }
    }

    mod summary {
        use super::*;

        #[test]
        fn test_summary_omits_key_path() {
            let ep = Endpoint::new("host", "ubuntu", "/secret/keys/id").unwrap();
            let json = serde_json::to_string(&ep.summary()).unwrap();
            assert!(!json.contains("/secret/keys/id"));
            assert!(json.contains("\"status\":\"unknown\""));
        }
    }
}
