//! Evaluator protocol message types.
//!
//! Length-prefixed JSON protocol between the daemon and the persistent
//! in-container evaluator (R variant). Messages are framed as:
//! `[4-byte BE length][JSON payload]`.

use serde::{Deserialize, Serialize};

/// Request sent from daemon to evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluatorRequest {
    /// Execute code, returning captured stdout/stderr and a result value.
    Execute { code: String },
    /// Health check.
    Ping,
}

/// Response sent from evaluator to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluatorResponse {
    /// Evaluator is ready to accept requests (sent once on connect).
    Ready,
    /// Execution result.
    Result {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// Pong response to health check.
    Pong,
    /// Error response.
    Error { message: String },
}
