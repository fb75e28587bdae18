//! Error types and transport error classification.
//!
//! Transport failures are classified from their message text into
//! authentication, protocol, timeout and I/O kinds. Only timeout and I/O
//! failures are worth retrying when a session connection is being opened.
//!
//! # Priority
//!
//! Authentication errors take precedence over connection errors. If an error message
//! contains both authentication and connection keywords, it is classified as
//! non-retryable to avoid repeatedly failing with bad credentials.

use thiserror::Error;

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "failed to load private key",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
];

/// Policy rejections raised by the security validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("Invalid hostname: {0}")]
    InvalidHostname(String),
    #[error("Empty command")]
    EmptyCommand,
    #[error("Dangerous command pattern detected: {0}")]
    DangerousPattern(String),
    #[error("Potentially unsafe command chaining detected: {0}")]
    UnsafeChaining(String),
    #[error("Sudo commands not allowed")]
    SudoNotAllowed,
    #[error("Incomplete sudo command")]
    IncompleteSudo,
    #[error("Invalid file path: {0}")]
    InvalidPath(String),
    #[error("Path traversal detected: {0}")]
    PathTraversal(String),
    #[error("Access to sensitive path denied: {0}")]
    SensitivePath(String),
    #[error("Invalid SSH key: {0}")]
    InvalidKey(String),
    #[error("Invalid environment variable name: {0}")]
    InvalidEnvName(String),
}

/// Failures of the remote-execution transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Connection error: {0}")]
    Io(String),
}

impl TransportError {
    /// Classify a raw transport error message.
    ///
    /// Unknown messages that mention "ssh" are treated as protocol errors,
    /// everything else unknown is treated as a transient I/O failure.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
            return TransportError::Auth(message);
        }
        if lower.contains("timed out") || lower.contains("timeout") {
            return TransportError::Timeout(message);
        }
        if RETRYABLE_ERRORS.iter().any(|p| lower.contains(p)) {
            return TransportError::Io(message);
        }
        if lower.contains("ssh") && !lower.contains("connect") {
            return TransportError::Protocol(message);
        }
        TransportError::Io(message)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Io(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Top-level error for the endpoint broker.
#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Security(#[from] SecurityError),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Terminal session not found: {0}")]
    SessionNotFound(String),
    #[error("Terminal session already exists: {0}")]
    SessionExists(String),
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),
    #[error("Endpoint already registered: {0}")]
    EndpointExists(String),
    #[error("No available endpoints")]
    NoEndpointAvailable,
    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, HardwareError>;
