//! MCP tool implementations for the hardware broker.
//!
//! Every tool that touches a host first runs auto-failover to pick the
//! active endpoint, then goes through the shared [`HardwareManager`]:
//!
//! - `connect`: Select an endpoint and report its hardware
//! - `execute_command`: Run a validated one-shot command
//! - `create_session` / `execute_in_session` / `close_session` / `list_sessions`:
//!   Persistent terminal sessions
//! - `get_hardware_info`: Cached or fresh hardware snapshot
//! - `manage_endpoints`: Add, remove, list, test and fail over endpoints
//! - `install_software`, `file_operations`, `system_monitoring`,
//!   `docker_operations`, `bulk_transfer`, `environment_setup`: Command templates
//! - `security_report`: Validator statistics and recent events

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use poem_mcpserver::{Tools, tool::StructuredContent};
use tracing::{info, warn};

use crate::mcp::endpoint::{Endpoint, EndpointPurpose, EndpointSpec};
use crate::mcp::error::HardwareError;
use crate::mcp::executor::ExecOptions;
use crate::mcp::manager::HardwareManager;
use crate::mcp::security::{FileAccess, Severity};
use crate::mcp::templates::{
    DEFAULT_MONITOR_SECS, DEFAULT_WORKSPACE, DOCKER_TIMEOUT, DockerOperation, DockerRequest,
    ENVIRONMENT_TIMEOUT, EnvironmentKind, FileOperation, FileRequest, INSTALL_TIMEOUT, Metric,
    PackageManager, TRANSFER_TIMEOUT, TransferOperation, docker_command, environment_command,
    file_command, install_command, monitoring_commands, transfer_command,
};
use crate::mcp::types::{
    BatchResponse, BatchStep, CloseSessionResponse, CommandResult, ConnectResponse,
    CreateSessionResponse, EndpointsResponse, HardwareInfoResponse, SecurityReportResponse,
    SessionListResponse, TerminalOutput,
};

/// MCP hardware tool implementation.
///
/// Holds the shared manager; one instance is created per MCP session.
pub struct McpHardwareCommands {
    manager: Arc<HardwareManager>,
}

impl McpHardwareCommands {
    pub fn new(manager: Arc<HardwareManager>) -> Self {
        Self { manager }
    }

    async fn endpoint(&self) -> Result<Endpoint, String> {
        self.manager.select_endpoint().await.map_err(|e| e.to_string())
    }

    async fn run(&self, endpoint: &Endpoint, command: &str, options: ExecOptions) -> CommandResult {
        self.manager
            .executor()
            .execute(endpoint, command, &options)
            .await
    }

    /// Select the active endpoint and attach its hardware snapshot.
    ///
    /// A failed inspection leaves the endpoint connected and the snapshot out.
    async fn connected(&self) -> Result<ConnectResponse, String> {
        let endpoint = self.endpoint().await?;
        let (hardware, hardware_error) =
            match self.manager.hardware().snapshot(&endpoint, false).await {
                Ok((snapshot, _)) => (Some(snapshot), None),
                Err(e) => {
                    warn!(
                        "Connected to {} without hardware info: {}",
                        endpoint.key(),
                        e
                    );
                    (None, Some(e.to_string()))
                }
            };

        let endpoint = self
            .manager
            .registry()
            .get(&endpoint.key())
            .unwrap_or(endpoint);
        info!("Connected to hardware endpoint {}", endpoint.key());

        Ok(ConnectResponse {
            endpoint: endpoint.summary(),
            hardware,
            hardware_error,
            timestamp: now(),
        })
    }

    /// Run a command built by a template, with sudo allowed when the
    /// template itself asks for it.
    async fn run_template(
        &self,
        command: &str,
        timeout: Duration,
        allow_sudo: bool,
    ) -> Result<StructuredContent<CommandResult>, String> {
        let endpoint = self.endpoint().await?;
        let options = ExecOptions {
            allow_sudo,
            ..ExecOptions::with_timeout(timeout)
        };
        Ok(StructuredContent(self.run(&endpoint, command, options).await))
    }
}

/// Prefix `sudo ` unless the command already starts with it.
pub(crate) fn with_sudo(command: &str, use_sudo: bool) -> String {
    let trimmed = command.trim_start();
    if use_sudo && !(trimmed == "sudo" || trimmed.starts_with("sudo ")) {
        format!("sudo {}", trimmed)
    } else {
        command.to_string()
    }
}

/// Parse every entry of a string list with `T::from_str`.
pub(crate) fn parse_all<T>(values: &[String]) -> Result<Vec<T>, String>
where
    T: FromStr<Err = HardwareError>,
{
    values
        .iter()
        .map(|v| v.parse::<T>().map_err(|e| e.to_string()))
        .collect()
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn endpoints_response(action: &str, success: bool, message: impl Into<String>) -> EndpointsResponse {
    EndpointsResponse {
        action: action.to_string(),
        success,
        message: message.into(),
        endpoints: Vec::new(),
        healthy: None,
        active: None,
        timestamp: now(),
    }
}

#[Tools]
impl McpHardwareCommands {
    /// Connect to the best available hardware endpoint.
    ///
    /// Runs auto-failover and returns the selected endpoint together with its
    /// hardware snapshot (cached when available).
    async fn connect(&self) -> Result<StructuredContent<ConnectResponse>, String> {
        self.connected().await.map(StructuredContent)
    }

    /// Execute a command on the active endpoint.
    ///
    /// The command is validated before it runs. Dangerous patterns are always
    /// rejected; `bypass_security` skips validation and is recorded in the
    /// security log.
    #[allow(clippy::too_many_arguments)]
    async fn execute_command(
        &self,
        /// Shell command to execute
        command: String,
        /// Command timeout in seconds (default: 30, env: HWMCP_COMMAND_TIMEOUT)
        timeout_secs: Option<u64>,
        /// Run the command with sudo (default: false)
        use_sudo: Option<bool>,
        /// Working directory to run the command in
        cwd: Option<String>,
        /// Environment variables set for the command
        env: Option<BTreeMap<String, String>>,
        /// Skip command validation (default: false)
        bypass_security: Option<bool>,
    ) -> Result<StructuredContent<CommandResult>, String> {
        let endpoint = self.endpoint().await?;
        let use_sudo = use_sudo.unwrap_or(false);
        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.manager.config().command_timeout);

        let options = ExecOptions {
            timeout,
            allow_sudo: use_sudo,
            bypass_security: bypass_security.unwrap_or(false),
            cwd,
            env: env.unwrap_or_default().into_iter().collect(),
        };
        let command = with_sudo(&command, use_sudo);
        Ok(StructuredContent(self.run(&endpoint, &command, options).await))
    }

    /// Create a persistent terminal session on the active endpoint.
    ///
    /// Working directory and environment changes persist between commands
    /// run with `execute_in_session`.
    async fn create_session(
        &self,
        /// Session ID to use (default: generated 8-character ID)
        session_id: Option<String>,
    ) -> Result<StructuredContent<CreateSessionResponse>, String> {
        let endpoint = self.endpoint().await?;
        let session_id = self
            .manager
            .terminals()
            .create(&endpoint, session_id)
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(CreateSessionResponse {
            message: format!(
                "Terminal session {} created on {}. Use execute_in_session to run commands.",
                session_id,
                endpoint.hostname()
            ),
            session_id,
            endpoint: endpoint.key(),
            timestamp: now(),
        }))
    }

    /// Close a terminal session and its connection.
    async fn close_session(
        &self,
        /// ID of the session to close
        session_id: String,
    ) -> StructuredContent<CloseSessionResponse> {
        let closed = self.manager.terminals().close(&session_id).await;
        if !closed {
            warn!("Close requested for unknown terminal session {}", session_id);
        }
        StructuredContent(CloseSessionResponse {
            session_id,
            closed,
            timestamp: now(),
        })
    }

    /// List open terminal sessions.
    async fn list_sessions(&self) -> StructuredContent<SessionListResponse> {
        let sessions = self.manager.terminals().list().await;
        StructuredContent(SessionListResponse {
            count: sessions.len(),
            sessions,
            timestamp: now(),
        })
    }

    /// Run a command inside a terminal session.
    ///
    /// Returns when the command finishes or the timeout elapses; `completed`
    /// tells which.
    async fn execute_in_session(
        &self,
        /// ID of the session to run in
        session_id: String,
        /// Command to send to the session's shell
        command: String,
        /// Seconds to wait for the command to finish (default: 30, env: HWMCP_COMMAND_TIMEOUT)
        timeout_secs: Option<u64>,
    ) -> Result<StructuredContent<TerminalOutput>, String> {
        let validator = self.manager.validator();
        if let Err(e) = validator.validate_command(&command, false) {
            validator.log_security_event(
                "BLOCKED_COMMAND",
                &format!("{} (session {}): {}", e, session_id, command),
                Severity::Warning,
            );
            return Err(format!("Security validation failed: {}", e));
        }

        let timeout = timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.manager.config().command_timeout);
        self.manager
            .terminals()
            .execute_in(&session_id, &command, timeout)
            .await
            .map(StructuredContent)
            .map_err(|e| e.to_string())
    }

    /// Get the hardware snapshot of the active endpoint.
    async fn get_hardware_info(
        &self,
        /// Collect a fresh snapshot instead of using the cache (default: false)
        refresh: Option<bool>,
    ) -> Result<StructuredContent<HardwareInfoResponse>, String> {
        let endpoint = self.endpoint().await?;
        let (hardware, cached) = self
            .manager
            .hardware()
            .snapshot(&endpoint, refresh.unwrap_or(false))
            .await
            .map_err(|e| e.to_string())?;

        Ok(StructuredContent(HardwareInfoResponse {
            hardware,
            cached,
            timestamp: now(),
        }))
    }

    /// Manage hardware endpoints.
    ///
    /// Actions: `add` (requires hostname, username, key_path), `remove`
    /// (hostname or host:port), `list`, `test` (probe all), `failover`
    /// (re-select the fastest endpoint).
    #[allow(clippy::too_many_arguments)]
    async fn manage_endpoints(
        &self,
        /// One of: add, remove, list, test, failover
        action: String,
        /// Endpoint hostname for add and remove
        hostname: Option<String>,
        /// SSH username for add
        username: Option<String>,
        /// Path to the SSH private key for add
        key_path: Option<String>,
        /// Platform tag for add (e.g. linux, centos, macos; default: unknown)
        platform: Option<String>,
        /// SSH port for add (default: 22)
        port: Option<u16>,
        /// Endpoint purpose for add: primary, backup, load-balance (default: primary)
        purpose: Option<String>,
    ) -> Result<StructuredContent<EndpointsResponse>, String> {
        let action = action.to_ascii_lowercase();
        let response = match action.as_str() {
            "add" => {
                let missing = |name: &str| format!("'{}' is required for the add action", name);
                let hostname = hostname.ok_or_else(|| missing("hostname"))?;
                let username = username.ok_or_else(|| missing("username"))?;
                let key_path = key_path.ok_or_else(|| missing("key_path"))?;

                let mut spec = EndpointSpec::new(hostname, username, PathBuf::from(key_path));
                if let Some(platform) = platform {
                    spec.platform = platform;
                }
                if let Some(port) = port {
                    spec.port = port;
                }
                if let Some(purpose) = purpose {
                    spec.purpose = purpose
                        .parse::<EndpointPurpose>()
                        .map_err(|e| e.to_string())?;
                }

                let endpoint = self.manager.add_endpoint(spec).map_err(|e| e.to_string())?;
                EndpointsResponse {
                    endpoints: vec![endpoint.summary()],
                    ..endpoints_response(
                        &action,
                        true,
                        format!("Added endpoint {}", endpoint.key()),
                    )
                }
            }
            "remove" => {
                let target = hostname
                    .ok_or_else(|| "'hostname' is required for the remove action".to_string())?;
                let removed = self
                    .manager
                    .remove_endpoint(&target)
                    .await
                    .map_err(|e| e.to_string())?;
                EndpointsResponse {
                    endpoints: vec![removed.summary()],
                    ..endpoints_response(
                        &action,
                        true,
                        format!("Removed endpoint {}", removed.key()),
                    )
                }
            }
            "list" => {
                let endpoints: Vec<_> = self
                    .manager
                    .registry()
                    .list()
                    .iter()
                    .map(Endpoint::summary)
                    .collect();
                let message = format!("{} endpoint(s) configured", endpoints.len());
                EndpointsResponse {
                    endpoints,
                    active: self.manager.failover().active().map(|e| e.summary()),
                    ..endpoints_response(&action, true, message)
                }
            }
            "test" => {
                let healthy = self.manager.health().probe_all().await;
                self.manager.persist();
                let endpoints: Vec<_> = self
                    .manager
                    .registry()
                    .list()
                    .iter()
                    .map(Endpoint::summary)
                    .collect();
                let message = format!("{}/{} endpoint(s) healthy", healthy, endpoints.len());
                EndpointsResponse {
                    endpoints,
                    healthy: Some(healthy),
                    ..endpoints_response(&action, true, message)
                }
            }
            "failover" => match self.manager.failover().reselect().await {
                Some(selected) => EndpointsResponse {
                    active: Some(selected.summary()),
                    ..endpoints_response(
                        &action,
                        true,
                        format!("Active endpoint is now {}", selected.key()),
                    )
                },
                None => endpoints_response(&action, false, "Failover failed: No available endpoints"),
            },
            other => {
                return Err(format!(
                    "Unknown action '{}'. Expected one of: add, remove, list, test, failover",
                    other
                ));
            }
        };
        Ok(StructuredContent(response))
    }

    /// Install packages on the active endpoint.
    async fn install_software(
        &self,
        /// Packages to install
        packages: Vec<String>,
        /// One of: auto, apt, yum, dnf, pip, npm (default: auto, picked from the endpoint platform)
        package_manager: Option<String>,
    ) -> Result<StructuredContent<CommandResult>, String> {
        let manager = package_manager
            .as_deref()
            .map(PackageManager::from_str)
            .transpose()
            .map_err(|e| e.to_string())?
            .unwrap_or_default();
        let endpoint = self.endpoint().await?;
        let (resolved, command) =
            install_command(manager, endpoint.platform(), &packages).map_err(|e| e.to_string())?;
        info!(
            "Installing {} package(s) on {} with {}",
            packages.len(),
            endpoint.key(),
            resolved
        );

        let options = ExecOptions {
            allow_sudo: true,
            ..ExecOptions::with_timeout(INSTALL_TIMEOUT)
        };
        Ok(StructuredContent(self.run(&endpoint, &command, options).await))
    }

    /// Read, write or manage files on the active endpoint.
    ///
    /// Paths are validated first; writes to system locations are rejected.
    #[allow(clippy::too_many_arguments)]
    async fn file_operations(
        &self,
        /// One of: read, write, append, delete, copy, move, chmod, chown
        operation: String,
        /// Target file path
        path: String,
        /// Content for write and append
        content: Option<String>,
        /// Destination path for copy and move
        destination: Option<String>,
        /// Octal mode for chmod (default: 644)
        permissions: Option<String>,
        /// New owner for chown (user or user:group)
        owner: Option<String>,
    ) -> Result<StructuredContent<CommandResult>, String> {
        let operation: FileOperation = operation.parse().map_err(|e: HardwareError| e.to_string())?;
        let validator = self.manager.validator();
        let path = validator
            .validate_file_path(&path, operation.access())
            .map_err(|e| e.to_string())?;
        let destination = destination
            .as_deref()
            .map(|d| validator.validate_file_path(d, FileAccess::Write))
            .transpose()
            .map_err(|e| e.to_string())?;

        let command = file_command(
            operation,
            &FileRequest {
                path: &path,
                content: content.as_deref(),
                destination: destination.as_deref(),
                permissions: permissions.as_deref(),
                owner: owner.as_deref(),
            },
        )
        .map_err(|e| e.to_string())?;

        self.run_template(
            &command,
            self.manager.config().command_timeout,
            operation.needs_sudo(),
        )
        .await
    }

    /// Collect a system monitoring report from the active endpoint.
    async fn system_monitoring(
        &self,
        /// Metrics to collect: cpu, memory, disk, network, gpu, processes, all (default: all)
        metrics: Option<Vec<String>>,
        /// Per-command timeout in seconds (default: 10)
        duration_secs: Option<u64>,
    ) -> Result<StructuredContent<BatchResponse>, String> {
        let metrics: Vec<Metric> = parse_all(&metrics.unwrap_or_default())?;
        let endpoint = self.endpoint().await?;
        let timeout = Duration::from_secs(duration_secs.unwrap_or(DEFAULT_MONITOR_SECS));

        let mut steps = Vec::new();
        for (label, command) in monitoring_commands(&metrics) {
            let result = self
                .run(&endpoint, command, ExecOptions::with_timeout(timeout))
                .await;
            steps.push(BatchStep {
                label: label.to_string(),
                result,
            });
        }

        Ok(StructuredContent(BatchResponse {
            operation: "system_monitoring".to_string(),
            success: steps.iter().all(|s| s.result.success),
            steps,
            timestamp: now(),
        }))
    }

    /// Manage Docker containers and images on the active endpoint.
    #[allow(clippy::too_many_arguments)]
    async fn docker_operations(
        &self,
        /// One of: list, run, exec, stop, remove, build, pull, logs, inspect
        operation: String,
        /// Container name for run, exec, stop, remove, logs, inspect
        container_name: Option<String>,
        /// Image for run, build (tag) and pull
        image: Option<String>,
        /// Command to run in the container for run and exec
        command: Option<String>,
        /// Run detached (default: false)
        detach: Option<bool>,
        /// Allocate an interactive TTY (default: false)
        interactive: Option<bool>,
        /// Remove the container when it exits (default: true)
        remove: Option<bool>,
        /// Build context directory for build
        build_path: Option<String>,
    ) -> Result<StructuredContent<CommandResult>, String> {
        let operation: DockerOperation = operation.parse().map_err(|e: HardwareError| e.to_string())?;
        let defaults = DockerRequest::default();
        let docker = docker_command(
            operation,
            &DockerRequest {
                container: container_name.as_deref(),
                image: image.as_deref(),
                command: command.as_deref(),
                detach: detach.unwrap_or(defaults.detach),
                interactive: interactive.unwrap_or(defaults.interactive),
                remove: remove.unwrap_or(defaults.remove),
                build_path: build_path.as_deref(),
            },
        )
        .map_err(|e| e.to_string())?;

        self.run_template(&docker, DOCKER_TIMEOUT, true).await
    }

    /// Move file content to, from or within the active endpoint.
    ///
    /// `upload` writes `source` as the content of `destination`, `download`
    /// returns the content of `source`, `sync` copies the `source` directory
    /// (or only `files`) into `destination`.
    async fn bulk_transfer(
        &self,
        /// One of: upload, download, sync
        operation: String,
        /// Content for upload, remote path for download and sync
        source: String,
        /// Remote destination path for upload and sync
        destination: String,
        /// Specific remote files to sync instead of the whole source directory
        files: Option<Vec<String>>,
    ) -> Result<StructuredContent<CommandResult>, String> {
        let operation: TransferOperation =
            operation.parse().map_err(|e: HardwareError| e.to_string())?;
        let validator = self.manager.validator();

        let destination = match operation {
            TransferOperation::Download => destination,
            _ => validator
                .validate_file_path(&destination, FileAccess::Write)
                .map_err(|e| e.to_string())?,
        };
        let source = match operation {
            TransferOperation::Upload => source,
            _ => validator
                .validate_file_path(&source, FileAccess::Read)
                .map_err(|e| e.to_string())?,
        };

        let command = transfer_command(
            operation,
            &source,
            &destination,
            &files.unwrap_or_default(),
        )
        .map_err(|e| e.to_string())?;
        info!("Running {} transfer", operation);
        self.run_template(&command, TRANSFER_TIMEOUT, false).await
    }

    /// Prepare a development environment in a workspace directory.
    ///
    /// `conda` downloads and runs an installer, which needs agent mode or
    /// `bypass_security`.
    async fn environment_setup(
        &self,
        /// One of: python, node, docker, conda, custom
        environment_type: String,
        /// Packages to install (python, node, conda) or base image followed by RUN steps (docker)
        requirements: Option<Vec<String>>,
        /// Workspace directory (default: /tmp/ai_workspace)
        workspace_path: Option<String>,
        /// Skip command validation (default: false)
        bypass_security: Option<bool>,
    ) -> Result<StructuredContent<CommandResult>, String> {
        let kind: EnvironmentKind = environment_type
            .parse()
            .map_err(|e: HardwareError| e.to_string())?;
        let workspace = self
            .manager
            .validator()
            .validate_file_path(
                workspace_path.as_deref().unwrap_or(DEFAULT_WORKSPACE),
                FileAccess::Write,
            )
            .map_err(|e| e.to_string())?;

        let command = environment_command(kind, &requirements.unwrap_or_default(), &workspace);
        let endpoint = self.endpoint().await?;
        let options = ExecOptions {
            bypass_security: bypass_security.unwrap_or(false),
            ..ExecOptions::with_timeout(ENVIRONMENT_TIMEOUT)
        };
        Ok(StructuredContent(self.run(&endpoint, &command, options).await))
    }

    /// Report blocked commands and recent security events.
    async fn security_report(&self) -> StructuredContent<SecurityReportResponse> {
        StructuredContent(SecurityReportResponse {
            summary: self.manager.validator().security_summary(),
            timestamp: now(),
        })
    }
}
