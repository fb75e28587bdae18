//! One-shot command execution on pooled connections.
//!
//! Every request goes through the same gate: rate limit, then policy
//! validation, then a pooled connection. Failures at any stage come back as
//! a structured [`CommandResult`] rather than an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::mcp::endpoint::Endpoint;
use crate::mcp::error::{HardwareError, SecurityError, TransportError};
use crate::mcp::pool::ConnectionPool;
use crate::mcp::rate_limit::RateLimiter;
use crate::mcp::security::{SecurityValidator, Severity, check_env_name, shell_quote};
use crate::mcp::types::CommandResult;

pub struct CommandExecutor {
    pool: Arc<ConnectionPool>,
    validator: Arc<SecurityValidator>,
    rate_limiter: Arc<RateLimiter>,
}

/// Per-request execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    pub allow_sudo: bool,
    pub bypass_security: bool,
    /// Directory to `cd` into before running the command
    pub cwd: Option<String>,
    /// Variables assigned in front of the command
    pub env: Vec<(String, String)>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            allow_sudo: false,
            bypass_security: false,
            cwd: None,
            env: Vec::new(),
        }
    }
}

/// Wrap a validated command with its working directory and environment:
/// `cd '<cwd>' && NAME='value' ... <command>`.
///
/// A leading `sudo` stays in front of the assignments so they survive its
/// environment reset: `sudo NAME='value' <command>`.
pub(crate) fn build_invocation(command: &str, options: &ExecOptions) -> Result<String, SecurityError> {
    let mut line = String::new();
    if let Some(cwd) = options.cwd.as_deref().filter(|c| !c.trim().is_empty()) {
        line.push_str(&format!("cd {} && ", shell_quote(cwd)));
    }
    let mut command = command;
    if !options.env.is_empty()
        && let Some(rest) = command.trim_start().strip_prefix("sudo ")
    {
        line.push_str("sudo ");
        command = rest.trim_start();
    }
    for (name, value) in &options.env {
        check_env_name(name)?;
        line.push_str(&format!("{}={} ", name, shell_quote(value)));
    }
    line.push_str(command);
    Ok(line)
}

impl CommandExecutor {
    pub fn new(
        pool: Arc<ConnectionPool>,
        validator: Arc<SecurityValidator>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            pool,
            validator,
            rate_limiter,
        }
    }

    /// Run `command` on `endpoint`.
    ///
    /// The policy sees the bare command. The working directory and
    /// environment are applied after validation.
    pub async fn execute(
        &self,
        endpoint: &Endpoint,
        command: &str,
        options: &ExecOptions,
    ) -> CommandResult {
        let identifier = format!("execute:{}", endpoint.hostname());
        if !self.rate_limiter.check(&identifier) {
            return failure(
                endpoint,
                command,
                HardwareError::RateLimited(identifier).to_string(),
            );
        }

        if options.bypass_security {
            self.validator.log_security_event(
                "SECURITY_BYPASS",
                &format!("Validation bypassed for command: {}", command),
                Severity::Info,
            );
        } else if let Err(e) = self.validator.validate_command(command, options.allow_sudo) {
            self.validator.log_security_event(
                "BLOCKED_COMMAND",
                &format!("{}: {}", e, command),
                Severity::Warning,
            );
            return failure(endpoint, command, format!("Security validation failed: {}", e));
        }

        let line = match build_invocation(command, options) {
            Ok(line) => line,
            Err(e) => {
                return failure(endpoint, command, format!("Security validation failed: {}", e));
            }
        };
        self.run(endpoint, &line, options.timeout).await
    }

    async fn run(&self, endpoint: &Endpoint, command: &str, timeout: Duration) -> CommandResult {
        let pooled = match self.pool.acquire(endpoint).await {
            Ok(pooled) => pooled,
            Err(e) => return failure(endpoint, command, error_message(&e)),
        };

        debug!("Executing on {}: {}", endpoint.key(), command);
        let outcome = pooled.connection().exec(command, timeout).await;
        self.pool.release(pooled).await;

        match outcome {
            Ok(output) => {
                let success = output.succeeded();
                info!(
                    "Command on {} finished with exit code {:?}",
                    endpoint.key(),
                    output.exit_code
                );
                CommandResult {
                    success,
                    exit_code: output.exit_code,
                    stdout: Some(self.validator.sanitize_command_output(&output.stdout)),
                    stderr: Some(self.validator.sanitize_command_output(&output.stderr)),
                    error: None,
                    command: command.to_string(),
                    endpoint: endpoint.hostname().to_string(),
                    timestamp: Utc::now().to_rfc3339(),
                }
            }
            Err(e) => failure(endpoint, command, transport_message(&e)),
        }
    }
}

fn transport_message(e: &TransportError) -> String {
    match e {
        TransportError::Timeout(_) => "Command execution timeout".to_string(),
        other => other.to_string(),
    }
}

fn error_message(e: &HardwareError) -> String {
    match e {
        HardwareError::Transport(t) => transport_message(t),
        other => other.to_string(),
    }
}

fn failure(endpoint: &Endpoint, command: &str, error: String) -> CommandResult {
    CommandResult {
        success: false,
        exit_code: None,
        stdout: None,
        stderr: None,
        error: Some(error),
        command: command.to_string(),
        endpoint: endpoint.hostname().to_string(),
        timestamp: Utc::now().to_rfc3339(),
    }
}
