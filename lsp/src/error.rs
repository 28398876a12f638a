//! Failure taxonomy for the analysis subsystem.
//!
//! Every public entry point returns [`LspError`]. Callers branch on
//! [`LspError::kind`] and, when [`LspError::is_degraded`] holds, fall back to
//! default output instead of failing their own request.

use std::time::Duration;

use serde::Serialize;

use crate::client::ClientState;

/// Stable classification of an [`LspError`], used in logs and health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StartupFailure,
    Timeout,
    Crashed,
    ServerError,
    CircuitOpen,
    NotRunning,
    ShuttingDown,
    Transport,
    Protocol,
    InvalidRequest,
    Disabled,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartupFailure => "startup_failure",
            Self::Timeout => "timeout",
            Self::Crashed => "crashed",
            Self::ServerError => "server_error",
            Self::CircuitOpen => "circuit_open",
            Self::NotRunning => "not_running",
            Self::ShuttingDown => "shutting_down",
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::InvalidRequest => "invalid_request",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LspError {
    /// The child could not be spawned or the handshake failed.
    #[error("analysis server failed to start: {message}")]
    StartupFailure { message: String },

    #[error("{method} timed out after {}ms", .timeout.as_millis())]
    Timeout { method: String, timeout: Duration },

    /// The child exited outside of a deliberate shutdown.
    #[error("analysis server exited unexpectedly{}", exit_suffix(.exit_status.as_deref()))]
    Crashed { exit_status: Option<String> },

    /// A well-formed JSON-RPC error reply.
    #[error("analysis server returned error {code}: {message}")]
    ServerError { code: i64, message: String },

    #[error("circuit '{breaker}' is open; retry in {}s", .retry_after.as_secs())]
    CircuitOpen {
        breaker: String,
        retry_after: Duration,
    },

    #[error("analysis client is not running (state: {state})")]
    NotRunning { state: ClientState },

    #[error("analysis client is shutting down")]
    ShuttingDown,

    #[error("transport failure: {0}")]
    Transport(String),

    /// The server replied with something we could not interpret.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The caller asked for something no server could answer.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("analysis subsystem is disabled")]
    Disabled,
}

fn exit_suffix(status: Option<&str>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl LspError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StartupFailure { .. } => ErrorKind::StartupFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Crashed { .. } => ErrorKind::Crashed,
            Self::ServerError { .. } => ErrorKind::ServerError,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::ShuttingDown => ErrorKind::ShuttingDown,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Disabled => ErrorKind::Disabled,
        }
    }

    /// Whether the subsystem as a whole is unavailable, as opposed to this
    /// particular query having failed.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        !matches!(
            self,
            Self::ServerError { .. } | Self::Protocol(_) | Self::InvalidRequest(_)
        )
    }

    pub(crate) fn startup(message: impl Into<String>) -> Self {
        Self::StartupFailure {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for LspError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
