//! Container runtime adapter.
//!
//! A narrow, testable facade over the external container daemon: create,
//! start, stop, remove, inspect, exec-inside, and archive transfer. Nothing
//! outside this module talks to the daemon directly — the session registry
//! and execution engine only see [`RuntimeAdapter`].

mod docker;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use docker::DockerAdapter;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SandboxError};

/// Opaque handle to a container, returned by [`RuntimeAdapter::create`] and
/// threaded through every subsequent call. Callers never parse it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle(pub String);

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bind or tmpfs mount applied at container creation.
#[derive(Debug, Clone)]
pub enum MountSpec {
    /// Host directory bind-mounted read-write into the container.
    Bind {
        host_path: String,
        container_path: String,
    },
    /// In-container tmpfs, size in bytes, always `noexec,nosuid`.
    Tmpfs {
        container_path: String,
        size_bytes: u64,
    },
}

/// Host port to in-container port mapping requested at creation; resolved to
/// a concrete host port by [`RuntimeAdapter::inspect`] after start.
#[derive(Debug, Clone, Copy)]
pub struct PortBinding {
    pub container_port: u16,
}

/// The fixed security profile applied to every container this system creates.
/// Not configurable per-session: non-root UID, read-only root, all
/// capabilities dropped, no-new-privileges, no inherited network by default.
#[derive(Debug, Clone)]
pub struct SecurityProfile {
    pub uid: u32,
    pub read_only_root: bool,
    pub drop_all_capabilities: bool,
    pub no_new_privileges: bool,
    pub network_disabled: bool,
}

impl Default for SecurityProfile {
    fn default() -> Self {
        Self {
            uid: 1000,
            read_only_root: true,
            drop_all_capabilities: true,
            no_new_privileges: true,
            network_disabled: true,
        }
    }
}

/// Resource caps applied at creation.
#[derive(Debug, Clone, Copy)]
pub struct ResourceCaps {
    pub memory_bytes: i64,
    pub cpu_quota_micros: i64,
}

/// Everything needed to create a container for one session.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub env: HashMap<String, String>,
    pub resources: ResourceCaps,
    pub security: SecurityProfile,
    pub mounts: Vec<MountSpec>,
    pub port_bindings: Vec<PortBinding>,
}

/// Liveness/port state returned by [`RuntimeAdapter::inspect`].
#[derive(Debug, Clone)]
pub struct InspectResult {
    pub running: bool,
    /// Host port mapped to each requested container port, in request order.
    pub host_ports: Vec<Option<u16>>,
}

/// Captured output of an in-container exec.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// The process was killed because `time_budget` elapsed.
    pub timed_out: bool,
}

/// Narrow adapter trait over the container runtime's native API. One
/// implementation talks to a real daemon ([`DockerAdapter`]); a second,
/// in-memory implementation backs the test suite ([`fake::FakeAdapter`]).
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Create (but do not start) a container per `spec`, applying the fixed
    /// security profile. Fails with `runtime_unavailable` or `image_missing`.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle>;

    /// Start a previously created container.
    async fn start(&self, handle: &ContainerHandle) -> Result<()>;

    /// Stop a running container, giving it `grace` to exit before killing it.
    /// Idempotent: stopping an already-stopped container succeeds.
    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()>;

    /// Remove a stopped container. Idempotent: removing a gone container
    /// succeeds silently unless `force` is false and it's still running.
    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<()>;

    /// Inspect a container's running state and resolved port mappings.
    async fn inspect(&self, handle: &ContainerHandle) -> Result<InspectResult>;

    /// Run `argv` inside the container, piping `stdin`, bounded by
    /// `time_budget` and `byte_budget` (applied independently to stdout and
    /// stderr). Never returns before the process ends, the time budget
    /// elapses, or a stream exceeds its byte budget.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        stdin: &[u8],
        time_budget: Duration,
        byte_budget: usize,
    ) -> Result<ExecResult>;

    /// Write `bytes` (a tar archive) into the container at `in_container_path`,
    /// which the caller has already normalized and confined.
    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        in_container_path: &str,
        bytes: Vec<u8>,
    ) -> Result<()>;

    /// Read a tar archive of `in_container_path` out of the container.
    async fn get_archive(
        &self,
        handle: &ContainerHandle,
        in_container_path: &str,
    ) -> Result<Vec<u8>>;
}

/// Classify a daemon-connection failure the way every adapter method should:
/// unreachable/connection-refused maps to `runtime_unavailable`, a 404 on an
/// image reference maps to `image_missing`, everything else is `internal`.
pub(crate) fn classify_daemon_error(context: &str, err: impl std::fmt::Display) -> SandboxError {
    let text = err.to_string();
    if text.contains("No such image") || text.contains("404") && text.contains("image") {
        SandboxError::ImageMissing(text)
    } else if text.contains("connection refused")
        || text.contains("os error 2")
        || text.contains("No such file or directory")
    {
        SandboxError::RuntimeUnavailable(format!("{context}: {text}"))
    } else {
        SandboxError::internal(format!("{context}: {text}"))
    }
}
