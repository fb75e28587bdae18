//! Configuration resolution for the hardware MCP server.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HWMCP_CONNECT_TIMEOUT` | 10s | Connect, auth and banner timeout in seconds |
//! | `HWMCP_COMMAND_TIMEOUT` | 30s | Command execution timeout in seconds |
//! | `HWMCP_MAX_RETRIES` | 3 | Maximum retry attempts for session connections |
//! | `HWMCP_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `HWMCP_COMPRESSION` | true | Enable zlib compression |
//! | `HWMCP_MAX_POOL_SIZE` | 5 | Idle connections kept per endpoint |
//! | `HWMCP_MAX_REQUESTS_PER_MINUTE` | 60 (120 in agent mode) | Rate limit ceiling |
//! | `HWMCP_RATE_LIMITING` | true | Enable rate limiting |
//! | `HWMCP_AGENT_MODE` | false | Elevated limits and extended allow-list |
//! | `HWMCP_HEALTH_CHECK_INTERVAL` | 300s | Health probe loop interval |
//! | `HWMCP_SESSION_TIMEOUT` | 3600s | Terminal session idle timeout |
//! | `HWMCP_SWEEP_INTERVAL` | 300s | Idle session sweep interval |
//! | `HWMCP_REGISTRY_PATH` | `mcp-server-config.json` | Persisted endpoint registry |
//! | `HWMCP_VALIDATE_KEYS` | true | Validate key files when endpoints are added |
//! | `HWMCP_TERMINAL_COMPLETION` | `sentinel` | `sentinel` or `prompt` completion detection |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::mcp::error::{HardwareError, Result};
use crate::mcp::terminal::CompletionMode;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub(crate) const DEFAULT_MAX_POOL_SIZE: usize = 5;
pub(crate) const DEFAULT_MAX_REQUESTS_PER_MINUTE: usize = 60;
pub(crate) const AGENT_MAX_REQUESTS_PER_MINUTE: usize = 120;
pub(crate) const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 300;
pub(crate) const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
pub(crate) const DEFAULT_REGISTRY_PATH: &str = "mcp-server-config.json";

/// Maximum retry delay cap for session connections
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Backoff applied by background loops after an unexpected error
pub(crate) const LOOP_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Upper bound for liveness and health probe commands
pub(crate) const PROBE_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "HWMCP_CONNECT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "HWMCP_COMMAND_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "HWMCP_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "HWMCP_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "HWMCP_COMPRESSION";
pub(crate) const MAX_POOL_SIZE_ENV_VAR: &str = "HWMCP_MAX_POOL_SIZE";
pub(crate) const MAX_REQUESTS_ENV_VAR: &str = "HWMCP_MAX_REQUESTS_PER_MINUTE";
pub(crate) const RATE_LIMITING_ENV_VAR: &str = "HWMCP_RATE_LIMITING";
pub(crate) const AGENT_MODE_ENV_VAR: &str = "HWMCP_AGENT_MODE";
pub(crate) const HEALTH_CHECK_INTERVAL_ENV_VAR: &str = "HWMCP_HEALTH_CHECK_INTERVAL";
pub(crate) const SESSION_TIMEOUT_ENV_VAR: &str = "HWMCP_SESSION_TIMEOUT";
pub(crate) const SWEEP_INTERVAL_ENV_VAR: &str = "HWMCP_SWEEP_INTERVAL";
pub(crate) const REGISTRY_PATH_ENV_VAR: &str = "HWMCP_REGISTRY_PATH";
pub(crate) const VALIDATE_KEYS_ENV_VAR: &str = "HWMCP_VALIDATE_KEYS";
pub(crate) const TERMINAL_COMPLETION_ENV_VAR: &str = "HWMCP_TERMINAL_COMPLETION";

/// Resolve a parsed value with priority: parameter -> env var -> default.
///
/// Unparseable environment values fall back to the default.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

/// Resolve a boolean flag. Only `true` (any case) and `1` enable it from the environment.
fn resolve_flag(param: Option<bool>, env_var: &str, default: bool) -> bool {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var) {
        return raw.eq_ignore_ascii_case("true") || raw == "1";
    }

    default
}

/// Resolve the command execution timeout in seconds
pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> u64 {
    resolve(
        timeout_param,
        COMMAND_TIMEOUT_ENV_VAR,
        DEFAULT_COMMAND_TIMEOUT_SECS,
    )
}

/// Resolve the compression setting (default: enabled)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    resolve_flag(compress_param, COMPRESSION_ENV_VAR, true)
}

/// Resolve the rate-limit ceiling, which doubles in agent mode
pub(crate) fn resolve_max_requests(param: Option<usize>, agent_mode: bool) -> usize {
    let default = if agent_mode {
        AGENT_MAX_REQUESTS_PER_MINUTE
    } else {
        DEFAULT_MAX_REQUESTS_PER_MINUTE
    };
    resolve(param, MAX_REQUESTS_ENV_VAR, default)
}

/// Validated runtime configuration for a [`HardwareManager`](crate::mcp::HardwareManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compression: bool,
    pub max_pool_size: usize,
    pub max_requests_per_minute: usize,
    pub rate_limiting: bool,
    pub agent_mode: bool,
    pub health_check_interval: Duration,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub registry_path: PathBuf,
    pub validate_keys: bool,
    pub terminal_completion: CompletionMode,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compression: true,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_requests_per_minute: DEFAULT_MAX_REQUESTS_PER_MINUTE,
            rate_limiting: true,
            agent_mode: false,
            health_check_interval: Duration::from_secs(DEFAULT_HEALTH_CHECK_INTERVAL_SECS),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            validate_keys: true,
            terminal_completion: CompletionMode::default(),
        }
    }
}

impl ManagerConfig {
    /// Build the configuration from environment variables and defaults.
    pub fn from_env() -> Result<Self> {
        let agent_mode = resolve_flag(None, AGENT_MODE_ENV_VAR, false);
        let config = Self {
            connect_timeout: Duration::from_secs(resolve(
                None,
                CONNECT_TIMEOUT_ENV_VAR,
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )),
            command_timeout: Duration::from_secs(resolve_command_timeout(None)),
            max_retries: resolve(None, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES),
            retry_delay: Duration::from_millis(resolve(
                None,
                RETRY_DELAY_MS_ENV_VAR,
                DEFAULT_RETRY_DELAY_MS,
            )),
            compression: resolve_compression(None),
            max_pool_size: resolve(None, MAX_POOL_SIZE_ENV_VAR, DEFAULT_MAX_POOL_SIZE),
            max_requests_per_minute: resolve_max_requests(None, agent_mode),
            rate_limiting: resolve_flag(None, RATE_LIMITING_ENV_VAR, true),
            agent_mode,
            health_check_interval: Duration::from_secs(resolve(
                None,
                HEALTH_CHECK_INTERVAL_ENV_VAR,
                DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            )),
            session_timeout: Duration::from_secs(resolve(
                None,
                SESSION_TIMEOUT_ENV_VAR,
                DEFAULT_SESSION_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(resolve(
                None,
                SWEEP_INTERVAL_ENV_VAR,
                DEFAULT_SWEEP_INTERVAL_SECS,
            )),
            registry_path: PathBuf::from(resolve(
                None,
                REGISTRY_PATH_ENV_VAR,
                DEFAULT_REGISTRY_PATH.to_string(),
            )),
            validate_keys: resolve_flag(None, VALIDATE_KEYS_ENV_VAR, true),
            terminal_completion: resolve(
                None,
                TERMINAL_COMPLETION_ENV_VAR,
                CompletionMode::default(),
            ),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the broker unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(HardwareError::Configuration(
                "max_pool_size must be at least 1".to_string(),
            ));
        }
        if self.max_requests_per_minute == 0 {
            return Err(HardwareError::Configuration(
                "max_requests_per_minute must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(HardwareError::Configuration(
                "timeouts must be greater than zero".to_string(),
            ));
        }
        if self.health_check_interval.is_zero() || self.sweep_interval.is_zero() {
            return Err(HardwareError::Configuration(
                "loop intervals must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
