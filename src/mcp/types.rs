//! Serializable response types for the hardware MCP tools.
//!
//! All types implement `Serialize`, `Deserialize`, and `JsonSchema` for
//! MCP protocol compatibility. Every response carries an RFC3339 timestamp.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::endpoint::EndpointSummary;
use super::hardware::HardwareSnapshot;
use super::security::SecuritySummary;

/// Outcome of one command run through the executor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Sanitized standard output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Sanitized standard error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Why the command did not run or did not finish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub command: String,
    /// Endpoint hostname the command targeted
    pub endpoint: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ConnectResponse {
    pub endpoint: EndpointSummary,
    /// Absent when the endpoint could not be inspected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_error: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HardwareInfoResponse {
    pub hardware: HardwareSnapshot,
    /// Whether the snapshot came from the cache
    pub cached: bool,
    pub timestamp: String,
}

/// Terminal session metadata
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TerminalSessionInfo {
    pub session_id: String,
    /// Endpoint key (`host:port`) the session is attached to
    pub endpoint: String,
    pub created_at: String,
    pub last_activity: String,
    /// Number of commands in the session history
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub history_len: usize,
    pub interactive: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub endpoint: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CloseSessionResponse {
    pub session_id: String,
    /// False when no such session existed
    pub closed: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<TerminalSessionInfo>,
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub count: usize,
    pub timestamp: String,
}

/// Output of a command run inside a terminal session
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TerminalOutput {
    pub session_id: String,
    pub command: String,
    /// Sanitized output, without the echoed input or completion marker
    pub output: String,
    /// False when the timeout elapsed before the command finished
    pub completed: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EndpointsResponse {
    pub action: String,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<EndpointSummary>,
    /// Endpoints that passed a `test` action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "crate::mcp::schema::uint")]
    pub healthy: Option<usize>,
    /// Endpoint selected by a `failover` action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<EndpointSummary>,
    pub timestamp: String,
}

/// One labelled command of a multi-command operation
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BatchStep {
    pub label: String,
    pub result: CommandResult,
}

/// Result of a tool that runs several commands (monitoring, transfers)
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BatchResponse {
    pub operation: String,
    /// True when every step succeeded
    pub success: bool,
    pub steps: Vec<BatchStep>,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SecurityReportResponse {
    #[serde(flatten)]
    pub summary: SecuritySummary,
    pub timestamp: String,
}
