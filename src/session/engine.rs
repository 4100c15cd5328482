//! Execution engine: the per-variant policy for running a code string inside
//! a session and returning captured streams.
//!
//! Two variants coexist. The one-shot variant (Python) spawns a fresh
//! interpreter process per call via the runtime adapter's `exec`. The
//! persistent variant (R) opens a transport to a long-running in-container
//! evaluator and keeps session-local state across calls by construction.

use std::time::{Duration, Instant};

use crate::config::Language;
use crate::error::{Result, SandboxError};
use crate::runtime::{ContainerHandle, RuntimeAdapter};
use crate::transport::{EvaluatorRequest, EvaluatorResponse, Transport};

/// Per-call override of the defaults, named `limits` on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteLimits {
    pub max_duration_seconds: Option<u64>,
    pub max_output_bytes: Option<usize>,
}

/// Result of one `execute_in_session` call.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub output: String,
    pub success: bool,
    pub elapsed_seconds: f64,
    pub output_truncated: bool,
}

const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(30);
const DEFAULT_BYTE_BUDGET: usize = 1024 * 1024;

fn effective_budgets(limits: Option<ExecuteLimits>) -> (Duration, usize) {
    let limits = limits.unwrap_or_default();
    let time_budget = limits
        .max_duration_seconds
        .filter(|&s| s > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIME_BUDGET);
    let byte_budget = limits
        .max_output_bytes
        .filter(|&b| b > 0)
        .unwrap_or(DEFAULT_BYTE_BUDGET);
    (time_budget, byte_budget)
}

fn combine(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.is_empty() {
        stdout.into_owned()
    } else if stdout.is_empty() {
        stderr.into_owned()
    } else {
        format!("{stdout}\n--- stderr ---\n{stderr}")
    }
}

/// Run one call of the one-shot (Python) variant: a fresh process per call,
/// no state surviving between calls.
pub async fn run_one_shot(
    runtime: &dyn RuntimeAdapter,
    handle: &ContainerHandle,
    code: &str,
    limits: Option<ExecuteLimits>,
) -> Result<ExecuteOutcome> {
    let (time_budget, byte_budget) = effective_budgets(limits);
    let argv = vec!["python3".to_string(), "-c".to_string(), code.to_string()];

    let start = Instant::now();
    let result = runtime
        .exec(handle, &argv, &[], time_budget, byte_budget)
        .await?;
    let elapsed_seconds = start.elapsed().as_secs_f64();

    if result.timed_out {
        return Err(SandboxError::Timeout(time_budget));
    }

    Ok(ExecuteOutcome {
        output: combine(&result.stdout, &result.stderr),
        success: result.exit_code == 0,
        elapsed_seconds,
        output_truncated: result.stdout_truncated || result.stderr_truncated,
    })
}

/// Classification of a persistent-evaluator transport failure, resolved by
/// inspecting the container's liveness.
pub enum PersistentFailure {
    /// Transport failed but the container is still running.
    EvaluatorUnreachable,
    /// The container has exited; the caller must close the session record.
    SessionCrashed,
}

/// Run one call of the persistent-evaluator (R) variant. On a transport
/// failure (anything but a timeout) the caller should resolve which of
/// [`PersistentFailure`] applies via [`classify_persistent_failure`] before
/// deciding whether to close the session.
pub async fn run_persistent(
    transport: &dyn Transport,
    code: &str,
    limits: Option<ExecuteLimits>,
) -> Result<ExecuteOutcome> {
    let (time_budget, byte_budget) = effective_budgets(limits);

    let start = Instant::now();
    let call = transport.request(&EvaluatorRequest::Execute {
        code: code.to_string(),
    });

    let response = tokio::time::timeout(time_budget, call)
        .await
        .map_err(|_| SandboxError::Timeout(time_budget))?
        .map_err(|e| SandboxError::EvaluatorUnreachable(e.to_string()))?;

    let elapsed_seconds = start.elapsed().as_secs_f64();

    match response {
        EvaluatorResponse::Result {
            mut stdout,
            stderr,
            exit_code,
        } => {
            let mut output = combine(stdout.as_bytes(), stderr.as_bytes());
            let truncated = output.len() > byte_budget;
            if truncated {
                output.truncate(byte_budget);
            }
            stdout.clear(); // release the intermediate buffer promptly
            Ok(ExecuteOutcome {
                output,
                success: exit_code == 0,
                elapsed_seconds,
                output_truncated: truncated,
            })
        }
        EvaluatorResponse::Error { message } => Ok(ExecuteOutcome {
            output: message,
            success: false,
            elapsed_seconds,
            output_truncated: false,
        }),
        other => Err(SandboxError::internal(format!(
            "unexpected evaluator response: {other:?}"
        ))),
    }
}

/// Decide whether `language` is backed by the one-shot or the persistent
/// execution engine.
#[must_use]
pub fn is_persistent(language: Language) -> bool {
    language.is_persistent()
}

/// Resolve a persistent-evaluator transport failure against the runtime's own
/// view of the container: still running means the evaluator itself died or
/// the socket reset, still retryable; exited means the whole session is gone.
pub async fn classify_persistent_failure(
    runtime: &dyn RuntimeAdapter,
    handle: &ContainerHandle,
) -> PersistentFailure {
    match runtime.inspect(handle).await {
        Ok(status) if status.running => PersistentFailure::EvaluatorUnreachable,
        _ => PersistentFailure::SessionCrashed,
    }
}
