//! In-memory [`RuntimeAdapter`] double used by the test suite.
//!
//! Models just enough container-daemon behavior to exercise the session
//! manager's lifecycle and error paths without a real daemon: a fixed set of
//! "known" images, an in-memory filesystem per container for archive
//! transfer, and a scriptable exec handler.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{
    ContainerHandle, ContainerSpec, ExecResult, InspectResult, RuntimeAdapter,
};
use crate::error::{Result, SandboxError};

/// A fake container's observable state.
struct FakeContainer {
    running: bool,
    host_port: Option<u16>,
    /// Full in-container path -> file bytes. Mirrors the real daemon's
    /// filesystem closely enough for put/get_archive to round-trip through
    /// actual tar encoding, including directory listings.
    files: HashMap<String, Vec<u8>>,
}

/// In-memory runtime double. `exec_handler` lets tests script exec() without
/// a real interpreter; the default handler just echoes the code as stdout.
pub struct FakeAdapter {
    containers: Mutex<HashMap<String, FakeContainer>>,
    known_images: Vec<String>,
    next_port: Mutex<u16>,
    exec_handler: Box<dyn Fn(&[String], &[u8]) -> ExecResult + Send + Sync>,
}

impl FakeAdapter {
    #[must_use]
    pub fn new(known_images: Vec<String>) -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            known_images,
            next_port: Mutex::new(30000),
            exec_handler: Box::new(|_argv, stdin| ExecResult {
                stdout: stdin.to_vec(),
                stderr: Vec::new(),
                exit_code: 0,
                stdout_truncated: false,
                stderr_truncated: false,
                timed_out: false,
            }),
        }
    }

    #[must_use]
    pub fn with_exec_handler(
        known_images: Vec<String>,
        handler: impl Fn(&[String], &[u8]) -> ExecResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            exec_handler: Box::new(handler),
            ..Self::new(known_images)
        }
    }

    /// Force a container to report as exited, simulating a crashed evaluator.
    pub fn kill(&self, handle: &ContainerHandle) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(&handle.0) {
            c.running = false;
        }
    }

    pub fn live_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }
}

#[async_trait]
impl RuntimeAdapter for FakeAdapter {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        if !self.known_images.contains(&spec.image) {
            return Err(SandboxError::ImageMissing(spec.image.clone()));
        }
        let id = format!("fake-{}", spec.name);
        let host_port = if spec.port_bindings.is_empty() {
            None
        } else {
            let mut next = self.next_port.lock().unwrap();
            let port = *next;
            *next += 1;
            Some(port)
        };
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                running: false,
                host_port,
                files: HashMap::new(),
            },
        );
        Ok(ContainerHandle(id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(&handle.0)
            .ok_or_else(|| SandboxError::RuntimeUnavailable(format!("no such container {handle}")))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle, _grace: Duration) -> Result<()> {
        if let Some(c) = self.containers.lock().unwrap().get_mut(&handle.0) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle, _force: bool) -> Result<()> {
        self.containers.lock().unwrap().remove(&handle.0);
        Ok(())
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<InspectResult> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(&handle.0)
            .ok_or_else(|| SandboxError::RuntimeUnavailable(format!("no such container {handle}")))?;
        Ok(InspectResult {
            running: container.running,
            host_ports: vec![container.host_port],
        })
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        stdin: &[u8],
        time_budget: Duration,
        byte_budget: usize,
    ) -> Result<ExecResult> {
        {
            let containers = self.containers.lock().unwrap();
            let container = containers.get(&handle.0).ok_or_else(|| {
                SandboxError::RuntimeUnavailable(format!("no such container {handle}"))
            })?;
            if !container.running {
                return Err(SandboxError::RuntimeUnavailable(format!(
                    "container {handle} not running"
                )));
            }
        }

        // Tests script long-running code as `"sleep:<millis>"`, either as the
        // call's stdin or as its last argv element (the one-shot engine
        // passes the code string as an argv element, not over stdin).
        let sleep_source = argv
            .last()
            .map(String::as_bytes)
            .filter(|a| a.starts_with(b"sleep:"))
            .or_else(|| Some(stdin).filter(|s| s.starts_with(b"sleep:")));
        if let Some(millis) = sleep_source
            .and_then(|rest| rest.strip_prefix(b"sleep:"))
            .and_then(|rest| std::str::from_utf8(rest).ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            let sleep = tokio::time::sleep(Duration::from_millis(millis));
            if tokio::time::timeout(time_budget, sleep).await.is_err() {
                return Ok(ExecResult {
                    timed_out: true,
                    ..ExecResult::default()
                });
            }
        }

        let mut result = (self.exec_handler)(argv, stdin);
        if result.stdout.len() > byte_budget {
            result.stdout.truncate(byte_budget);
            result.stdout_truncated = true;
        }
        if result.stderr.len() > byte_budget {
            result.stderr.truncate(byte_budget);
            result.stderr_truncated = true;
        }
        Ok(result)
    }

    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        in_container_path: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(&handle.0)
            .ok_or_else(|| SandboxError::RuntimeUnavailable(format!("no such container {handle}")))?;

        let mut archive = tar::Archive::new(bytes.as_slice());
        let entries = archive
            .entries()
            .map_err(|e| SandboxError::internal(format!("bad upload archive: {e}")))?;
        for entry in entries {
            let mut entry =
                entry.map_err(|e| SandboxError::internal(format!("bad upload entry: {e}")))?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let relative = entry
                .path()
                .map_err(|e| SandboxError::internal(e.to_string()))?
                .to_string_lossy()
                .into_owned();
            let full_path = format!(
                "{}/{relative}",
                in_container_path.trim_end_matches('/')
            );
            let mut content = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut content)
                .map_err(|e| SandboxError::internal(format!("failed to read upload entry: {e}")))?;
            container.files.insert(full_path, content);
        }
        Ok(())
    }

    async fn get_archive(
        &self,
        handle: &ContainerHandle,
        in_container_path: &str,
    ) -> Result<Vec<u8>> {
        let containers = self.containers.lock().unwrap();
        let container = containers
            .get(&handle.0)
            .ok_or_else(|| SandboxError::RuntimeUnavailable(format!("no such container {handle}")))?;

        let base_name = in_container_path
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(in_container_path)
            .to_string();

        if let Some(content) = container.files.get(in_container_path) {
            return build_tar(&base_name, content);
        }

        let prefix = format!("{}/", in_container_path.trim_end_matches('/'));
        let mut builder = tar::Builder::new(Vec::new());
        let mut found_any = false;
        for (path, content) in &container.files {
            let Some(suffix) = path.strip_prefix(&prefix) else {
                continue;
            };
            found_any = true;
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, format!("{base_name}/{suffix}"), content.as_slice())
                .map_err(|e| SandboxError::internal(format!("failed to build archive: {e}")))?;
        }
        if !found_any {
            return Err(SandboxError::InvalidPath(in_container_path.to_string()));
        }
        builder
            .into_inner()
            .map_err(|e| SandboxError::internal(format!("failed to finish archive: {e}")))
    }
}

fn build_tar(name: &str, content: &[u8]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, content)
        .map_err(|e| SandboxError::internal(format!("failed to build archive: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| SandboxError::internal(format!("failed to finish archive: {e}")))
}
