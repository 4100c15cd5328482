//! TCP transport to the persistent in-container evaluator.
//!
//! Connects once to `host_port` (the daemon's mapping of the evaluator's
//! fixed in-container port) and keeps the socket for the session's lifetime.
//! Mutex-guarded for safe concurrent access, the same shape the reference
//! daemon's stdio pipe transport uses for a child process's stdin/stdout.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use super::protocol::{EvaluatorRequest, EvaluatorResponse};
use super::{recv_message, send_message, Transport};

/// Transport that communicates with a persistent evaluator over a local TCP
/// socket mapped by the runtime adapter.
pub struct TcpTransport {
    reader: Mutex<ReadHalf<TcpStream>>,
    writer: Mutex<WriteHalf<TcpStream>>,
}

impl TcpTransport {
    /// Connect to the evaluator at `127.0.0.1:host_port` and wait for its
    /// `Ready` message.
    pub async fn connect(host_port: u16, ready_timeout: Duration) -> Result<Self> {
        debug!(port = host_port, "Connecting to evaluator");

        let stream = tokio::time::timeout(
            ready_timeout,
            TcpStream::connect(("127.0.0.1", host_port)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to evaluator on port {host_port}"))?
        .with_context(|| format!("Failed to connect to evaluator on port {host_port}"))?;

        let (mut read_half, write_half) = tokio::io::split(stream);

        let ready_bytes = tokio::time::timeout(ready_timeout, recv_message(&mut read_half))
            .await
            .map_err(|_| anyhow::anyhow!("Evaluator did not send Ready within {ready_timeout:?}"))?
            .context("Failed to read evaluator Ready message")?;

        let ready_msg: EvaluatorResponse = serde_json::from_slice(&ready_bytes)
            .context("Failed to parse evaluator Ready message")?;

        match ready_msg {
            EvaluatorResponse::Ready => debug!("Evaluator is ready"),
            other => anyhow::bail!("Expected Ready message, got: {other:?}"),
        }

        Ok(Self {
            reader: Mutex::new(read_half),
            writer: Mutex::new(write_half),
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, req: &EvaluatorRequest) -> Result<EvaluatorResponse> {
        // Acquire both locks for atomic send/receive.
        let mut writer = self.writer.lock().await;
        let mut reader = self.reader.lock().await;

        let req_bytes = serde_json::to_vec(req).context("Failed to serialize request")?;
        send_message(&mut *writer, &req_bytes)
            .await
            .context("Failed to send request to evaluator")?;

        let resp_bytes = recv_message(&mut *reader)
            .await
            .context("Failed to read response from evaluator")?;

        let resp: EvaluatorResponse =
            serde_json::from_slice(&resp_bytes).context("Failed to parse evaluator response")?;

        Ok(resp)
    }

    fn is_alive(&self) -> bool {
        // A closed socket only surfaces as a `request()` failure; the session
        // manager classifies that via `inspect()` against the runtime adapter
        // rather than polling the socket here.
        true
    }
}
