//! In-memory [`Transport`] double for exercising the persistent-evaluator
//! execution engine without a real container or TCP socket.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::protocol::{EvaluatorRequest, EvaluatorResponse};
use super::Transport;
use anyhow::Result;

/// Evaluates a tiny expression language sufficient for the persistent-state
/// round-trip tests: `name <- value` assigns, anything else is looked up (as
/// in `cat(name)`) or echoed back as a literal.
pub struct FakeEvaluator {
    vars: Mutex<HashMap<String, String>>,
    alive: Mutex<bool>,
}

impl FakeEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vars: Mutex::new(HashMap::new()),
            alive: Mutex::new(true),
        }
    }

    pub fn crash(&self) {
        *self.alive.lock().unwrap() = false;
    }
}

impl Default for FakeEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for FakeEvaluator {
    async fn request(&self, req: &EvaluatorRequest) -> Result<EvaluatorResponse> {
        if !*self.alive.lock().unwrap() {
            anyhow::bail!("connection reset by peer");
        }

        match req {
            EvaluatorRequest::Ping => Ok(EvaluatorResponse::Pong),
            EvaluatorRequest::Execute { code } => {
                let code = code.trim();
                let mut vars = self.vars.lock().unwrap();

                if let Some((name, value)) = code.split_once("<-") {
                    vars.insert(name.trim().to_string(), value.trim().to_string());
                    return Ok(EvaluatorResponse::Result {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: 0,
                    });
                }

                if let Some(name) = code.strip_prefix("cat(").and_then(|s| s.strip_suffix(')')) {
                    let value = vars.get(name.trim()).cloned().unwrap_or_default();
                    return Ok(EvaluatorResponse::Result {
                        stdout: value,
                        stderr: String::new(),
                        exit_code: 0,
                    });
                }

                if let Some(millis) = code
                    .strip_prefix("Sys.sleep(")
                    .and_then(|s| s.strip_suffix(')'))
                    .and_then(|s| s.parse::<f64>().ok())
                {
                    drop(vars);
                    tokio::time::sleep(std::time::Duration::from_secs_f64(millis)).await;
                    return Ok(EvaluatorResponse::Result {
                        stdout: String::new(),
                        stderr: String::new(),
                        exit_code: 0,
                    });
                }

                Ok(EvaluatorResponse::Result {
                    stdout: code.to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                })
            }
        }
    }

    fn is_alive(&self) -> bool {
        *self.alive.lock().unwrap()
    }
}
