//! Error taxonomy for the worker channel.
//!
//! Mirrors the propagation policy of the channel design: invocation-scoped
//! errors never poison the channel; channel-scoped errors propagate to every
//! waiting promise and drive a transition to `Failed`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerChannelError>;

/// Error categories recognized by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Timeout,
    ProtocolViolation,
    WorkerProcessFailure,
    LoadFailure,
    InvocationFailure,
    Cancelled,
    InvalidState,
}

#[derive(Debug, Clone, Error)]
pub enum WorkerChannelError {
    #[error("timed out waiting for {phase}")]
    Timeout { phase: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("worker process failure: {0}")]
    WorkerProcessFailure(String),

    #[error("function load failure for {function_id}: {reason}")]
    LoadFailure { function_id: String, reason: String },

    #[error("invocation {invocation_id} failed: {reason}")]
    InvocationFailure {
        invocation_id: String,
        reason: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("verb not permitted in state {state}")]
    InvalidState { state: String },

    #[error("{0}")]
    Other(String),
}

impl WorkerChannelError {
    pub fn timeout(phase: impl Into<String>) -> Self {
        Self::Timeout { phase: phase.into() }
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn worker_process_failure(msg: impl Into<String>) -> Self {
        Self::WorkerProcessFailure(msg.into())
    }

    pub fn load_failure(function_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LoadFailure {
            function_id: function_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invocation_failure(invocation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvocationFailure {
            invocation_id: invocation_id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState { state: state.into() }
    }

    /// Stable short code, useful for metrics tags and log correlation.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "WC_TIMEOUT",
            Self::ProtocolViolation(_) => "WC_PROTOCOL_VIOLATION",
            Self::WorkerProcessFailure(_) => "WC_WORKER_PROCESS_FAILURE",
            Self::LoadFailure { .. } => "WC_LOAD_FAILURE",
            Self::InvocationFailure { .. } => "WC_INVOCATION_FAILURE",
            Self::Cancelled => "WC_CANCELLED",
            Self::InvalidState { .. } => "WC_INVALID_STATE",
            Self::Other(_) => "WC_OTHER",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::ProtocolViolation(_) => ErrorCategory::ProtocolViolation,
            Self::WorkerProcessFailure(_) => ErrorCategory::WorkerProcessFailure,
            Self::LoadFailure { .. } => ErrorCategory::LoadFailure,
            Self::InvocationFailure { .. } => ErrorCategory::InvocationFailure,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::InvalidState { .. } => ErrorCategory::InvalidState,
            Self::Other(_) => ErrorCategory::InvocationFailure,
        }
    }

    /// Whether this error, when raised for a single verb, must propagate to
    /// every waiting promise and transition the channel to `Failed` — as
    /// opposed to staying scoped to one invocation or one function load.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::ProtocolViolation | ErrorCategory::WorkerProcessFailure
        )
    }
}

impl From<std::io::Error> for WorkerChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::WorkerProcessFailure(err.to_string())
    }
}

impl From<serde_json::Error> for WorkerChannelError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolViolation(err.to_string())
    }
}

impl From<errors::HostError> for WorkerChannelError {
    fn from(err: errors::HostError) -> Self {
        Self::Other(err.to_string())
    }
}

/// Extension trait mirroring the host's `.config_error()`-style helpers:
/// attach channel-error context to an arbitrary `Result` at the boundary
/// where a foreign error needs to join the taxonomy above.
pub trait ErrorExt<T> {
    fn protocol_error(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ErrorExt<T> for std::result::Result<T, E> {
    fn protocol_error(self, context: &str) -> Result<T> {
        self.map_err(|e| WorkerChannelError::protocol_violation(format!("{context}: {e}")))
    }
}
