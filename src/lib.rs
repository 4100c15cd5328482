//! Session Manager: a stateful, multi-tenant code-execution gateway fronting
//! an external container runtime.
//!
//! - [`config`] — environment-driven configuration, loaded once at startup.
//! - [`error`] — the stable `SandboxError` taxonomy carried in every response.
//! - [`runtime`] — the narrow adapter over the container runtime's API.
//! - [`session`] — the session registry, execution engine, and idle reaper.
//! - [`files`] — path-confined file transfer.
//! - [`transport`] — daemon-to-evaluator wire protocol for persistent sessions.
//! - [`mcp`] — the MCP tool-dispatch surface.

pub mod config;
pub mod error;
pub mod files;
pub mod mcp;
pub mod runtime;
pub mod session;
pub mod transport;
