//! Stable error taxonomy for the Session Manager.
//!
//! Every operation returns a response envelope; internal failures (`anyhow::Error`
//! from the runtime adapter, transport, or file layer) are translated into one of
//! these variants at the MCP dispatch boundary. The variant name is the wire-level
//! `error.code` — it must not change once a client depends on it.

use serde::Serialize;

/// The full, fixed error taxonomy exposed to MCP clients.
#[derive(Debug, Clone, thiserror::Error, Serialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SandboxError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("session '{0}' is still active, use force=true to close anyway")]
    SessionActive(String),

    #[error("session '{0}' is busy with another execute")]
    SessionBusy(String),

    #[error("session '{0}' evaluator process has crashed")]
    SessionCrashed(String),

    #[error("capacity exhausted: {0} sessions already live")]
    CapacityExhausted(usize),

    #[error("path escapes the sandbox workspace: {0}")]
    InvalidPath(String),

    #[error("file exceeds the {limit} byte transfer cap")]
    FileTooLarge { limit: u64 },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("image '{0}' not present at the runtime")]
    ImageMissing(String),

    #[error("evaluator unreachable: {0}")]
    EvaluatorUnreachable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error (correlation_id={correlation_id}): {message}")]
    Internal {
        message: String,
        correlation_id: String,
    },
}

impl SandboxError {
    /// Machine-readable, stable error code (matches the serde tag but kept as a
    /// plain method so callers don't need to round-trip through serde to read it).
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound(_) => "session_not_found",
            Self::SessionActive(_) => "session_active",
            Self::SessionBusy(_) => "session_busy",
            Self::SessionCrashed(_) => "session_crashed",
            Self::CapacityExhausted(_) => "capacity_exhausted",
            Self::InvalidPath(_) => "invalid_path",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::Timeout(_) => "timeout",
            Self::RuntimeUnavailable(_) => "runtime_unavailable",
            Self::ImageMissing(_) => "image_missing",
            Self::EvaluatorUnreachable(_) => "evaluator_unreachable",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether a client may usefully retry the same call unmodified.
    #[must_use]
    pub const fn retryable(&self) -> bool {
        match self {
            Self::SessionActive(_)
            | Self::SessionBusy(_)
            | Self::CapacityExhausted(_)
            | Self::RuntimeUnavailable(_)
            | Self::EvaluatorUnreachable(_) => true,

            Self::SessionNotFound(_)
            | Self::SessionCrashed(_)
            | Self::InvalidPath(_)
            | Self::FileTooLarge { .. }
            | Self::ImageMissing(_)
            | Self::InvalidArgument(_)
            | Self::Internal { .. } => false,

            // Retryable for file transfers, not for executes; the execution
            // engine downgrades this to non-retryable for that call site.
            Self::Timeout(_) => true,
        }
    }

    /// Build an `internal` error, tagging it with a correlation id for log
    /// correlation without leaking internal details to the caller.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        tracing::error!(correlation_id = %correlation_id, error = %err, "internal error");
        Self::Internal {
            message: "an internal error occurred".to_string(),
            correlation_id,
        }
    }
}

/// Adapt an opaque `anyhow::Error` from the runtime adapter or transport layer
/// into the taxonomy. Callers that can classify the failure more precisely
/// (e.g. distinguishing `runtime_unavailable` from `image_missing`) should
/// construct the specific variant directly instead of going through here.
impl From<anyhow::Error> for SandboxError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err)
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
