//! Transport layer for daemon ↔ persistent-evaluator communication.
//!
//! Provides the `Transport` trait and length-prefixed JSON framing functions.
//! [`tcp::TcpTransport`] connects to the host port the runtime adapter mapped
//! to the evaluator's fixed in-container port.

pub mod protocol;
pub mod tcp;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use protocol::{EvaluatorRequest, EvaluatorResponse};
pub use tcp::TcpTransport;

use anyhow::Result;
use async_trait::async_trait;

/// Maximum message size (64 MB). Safety valve against malformed messages.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Abstraction over daemon ↔ evaluator communication channels.
///
/// Implementations handle connection-specific details (TCP, in-process fake)
/// while the execution engine works with this uniform interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response.
    ///
    /// Access is mutex-guarded internally — concurrent callers serialize.
    async fn request(&self, req: &EvaluatorRequest) -> Result<EvaluatorResponse>;

    /// Check whether the underlying connection is still usable.
    fn is_alive(&self) -> bool;
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}
