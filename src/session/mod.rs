//! Session registry: owns the set of live sessions, enforces capacity, and
//! dispatches execution and file-transfer calls against the right variant.

pub mod engine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, Language};
use crate::error::{Result, SandboxError};
use crate::files::{self, FileContent, FileEntry};
use crate::runtime::{
    ContainerHandle, ContainerSpec, MountSpec, PortBinding, ResourceCaps, RuntimeAdapter,
    SecurityProfile,
};
use crate::transport::{TcpTransport, Transport};
use engine::{ExecuteLimits, ExecuteOutcome, PersistentFailure};

/// Fixed in-container port the persistent evaluator listens on.
const EVALUATOR_PORT: u16 = 8765;
/// How long to wait for the evaluator to dial in and send `Ready` after start.
const EVALUATOR_READY_TIMEOUT: Duration = Duration::from_secs(10);
const INSTALL_TIME_BUDGET: Duration = Duration::from_secs(120);
const INSTALL_BYTE_BUDGET: usize = 64 * 1024;

/// A live session's registry record.
struct Session {
    id: String,
    handle: ContainerHandle,
    language: Language,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    last_used: AsyncMutex<(Instant, DateTime<Utc>)>,
    /// Per-session idle timeout, overriding `Config::idle_timeout` when set
    /// via `create_session`'s `timeout_seconds`.
    idle_timeout: Duration,
    host_port: Option<u16>,
    #[allow(dead_code)]
    workspace_path: Option<std::path::PathBuf>,
    #[allow(dead_code)]
    env_snapshot: HashMap<String, String>,
    transport: Option<AsyncMutex<Box<dyn Transport>>>,
}

impl Session {
    async fn touch(&self) {
        let mut guard = self.last_used.lock().await;
        *guard = (Instant::now(), Utc::now());
    }

    async fn last_used_at(&self) -> Instant {
        self.last_used.lock().await.0
    }
}

/// Snapshot returned by `allocate` and `list`.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub host_port: Option<u16>,
}

/// Result of `install_package`.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub output: String,
    pub exit_code: i32,
}

/// Single-writer slot per session: the mutex serializes execution, `waiting`
/// caps the queue at one pending caller beyond whoever currently holds it.
struct ExecuteSlot {
    mutex: AsyncMutex<()>,
    waiting: AtomicBool,
    /// Flips to `true` when `close` wants to preempt whichever `execute` call
    /// currently holds `mutex`. A `watch` channel (not `Notify`) so a signal
    /// sent before the in-flight call starts watching isn't lost.
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl ExecuteSlot {
    fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            mutex: AsyncMutex::new(()),
            waiting: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        }
    }

    /// Signal the holder of `mutex`, if any, to abandon its work. Idempotent.
    fn request_cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Owns the live session set and drives lifecycle, execution, and file
/// transfer through the runtime adapter.
pub struct SessionManager {
    config: Arc<Config>,
    runtime: Arc<dyn RuntimeAdapter>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    execute_locks: RwLock<HashMap<String, Arc<ExecuteSlot>>>,
    /// In-flight `allocate` calls not yet inserted, counted against the cap
    /// so two concurrent creates at the boundary can't both succeed.
    reserved: AtomicUsize,
}

impl SessionManager {
    #[must_use]
    pub fn new(config: Arc<Config>, runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self {
            config,
            runtime,
            sessions: RwLock::new(HashMap::new()),
            execute_locks: RwLock::new(HashMap::new()),
            reserved: AtomicUsize::new(0),
        }
    }

    async fn get_execute_lock(&self, id: &str) -> Arc<ExecuteSlot> {
        if let Some(lock) = self.execute_locks.read().await.get(id) {
            return lock.clone();
        }
        let mut locks = self.execute_locks.write().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ExecuteSlot::new()))
            .clone()
    }

    /// Check capacity and provisionally reserve a slot, under the same
    /// exclusion boundary `allocate` later uses to commit it, so two
    /// concurrent callers at the cap can't both pass the check.
    async fn reserve_slot(&self) -> Result<()> {
        let sessions = self.sessions.write().await;
        let reserved = self.reserved.load(Ordering::SeqCst);
        if sessions.len() + reserved >= self.config.max_sessions {
            return Err(SandboxError::CapacityExhausted(sessions.len()));
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Release a reservation that didn't end in an insert (creation failed).
    async fn release_slot(&self) {
        let _sessions = self.sessions.write().await;
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }

    /// Create and start a new session's container, returning its summary.
    pub async fn allocate(
        &self,
        language: Language,
        timeout_override: Option<Duration>,
    ) -> Result<SessionSummary> {
        self.reserve_slot().await?;
        let session = match self.create_inner(language, timeout_override).await {
            Ok(session) => session,
            Err(e) => {
                self.release_slot().await;
                return Err(e);
            }
        };

        let summary = SessionSummary {
            id: session.id.clone(),
            created_at: session.created_at_utc,
            last_used_at: session.created_at_utc,
            host_port: session.host_port,
        };
        // Commit the reservation and the insert under the same write lock:
        // the session is visible in `sessions` and `reserved` drops by one
        // in the same atomic step, so no window lets the count undershoot.
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(session.id.clone(), Arc::new(session));
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(summary)
    }

    async fn create_inner(
        &self,
        language: Language,
        timeout_override: Option<Duration>,
    ) -> Result<Session> {
        let idle_timeout = timeout_override.unwrap_or(self.config.idle_timeout);
        let id = Uuid::new_v4().to_string();
        let name = format!("sbx-{id}");

        let workspace_path = self.config.workspace_dir_for(&id);
        let mut mounts = Vec::new();
        if let Some(host_dir) = &workspace_path {
            mounts.push(MountSpec::Bind {
                host_path: host_dir.to_string_lossy().into_owned(),
                container_path: files::SANDBOX_ROOT.to_string(),
            });
        } else if let Some(spec) = self.config.tmpfs_sizes.get(files::SANDBOX_ROOT) {
            mounts.push(MountSpec::Tmpfs {
                container_path: files::SANDBOX_ROOT.to_string(),
                size_bytes: spec.size_bytes,
            });
        }
        if let Some(spec) = self.config.tmpfs_sizes.get("/tmp") {
            mounts.push(MountSpec::Tmpfs {
                container_path: "/tmp".to_string(),
                size_bytes: spec.size_bytes,
            });
        }

        let is_persistent = language.is_persistent();
        let port_bindings = if is_persistent {
            vec![PortBinding {
                container_port: EVALUATOR_PORT,
            }]
        } else {
            Vec::new()
        };

        let mut security = SecurityProfile::default();
        // A fully isolated network namespace can't carry a published port or
        // reach a package index; both cases need a narrow exception.
        if is_persistent || self.config.package_install_network {
            security.network_disabled = false;
        }

        let spec = ContainerSpec {
            image: self.config.image_name.clone(),
            name,
            env: self.config.env_passthrough.clone(),
            resources: ResourceCaps {
                memory_bytes: self.config.per_session.memory_bytes,
                cpu_quota_micros: self.config.per_session.cpu_quota_micros,
            },
            security,
            mounts,
            port_bindings,
        };

        let handle = self.runtime.create(&spec).await?;

        match self.start_and_connect(&handle, is_persistent).await {
            Ok((host_port, transport)) => {
                let now_instant = Instant::now();
                let now_utc = Utc::now();
                info!(session = %id, language = ?language, "session created");
                Ok(Session {
                    id,
                    handle,
                    language,
                    created_at: now_instant,
                    created_at_utc: now_utc,
                    last_used: AsyncMutex::new((now_instant, now_utc)),
                    idle_timeout,
                    host_port,
                    workspace_path,
                    env_snapshot: self.config.env_passthrough.clone(),
                    transport: transport.map(AsyncMutex::new),
                })
            }
            Err(e) => {
                warn!(container = %handle, error = %e, "rolling back partially created session");
                let _ = self.runtime.stop(&handle, Duration::from_secs(1)).await;
                let _ = self.runtime.remove(&handle, true).await;
                Err(e)
            }
        }
    }

    async fn start_and_connect(
        &self,
        handle: &ContainerHandle,
        is_persistent: bool,
    ) -> Result<(Option<u16>, Option<Box<dyn Transport>>)> {
        self.runtime.start(handle).await?;
        let inspected = self.runtime.inspect(handle).await?;

        if !is_persistent {
            return Ok((None, None));
        }

        let host_port = inspected
            .host_ports
            .first()
            .copied()
            .flatten()
            .ok_or_else(|| {
                SandboxError::internal("runtime did not report a host port for the evaluator")
            })?;

        let transport = TcpTransport::connect(host_port, EVALUATOR_READY_TIMEOUT)
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;

        Ok((Some(host_port), Some(Box::new(transport))))
    }

    async fn find(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))
    }

    /// Snapshot every live session; `include_inactive` controls whether
    /// entries past the idle timeout are included (the registry itself never
    /// deletes on this path).
    pub async fn list(&self, include_inactive: bool) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            let (last_instant, last_utc) = *session.last_used.lock().await;
            if !include_inactive && last_instant.elapsed() >= session.idle_timeout {
                continue;
            }
            out.push(SessionSummary {
                id: session.id.clone(),
                created_at: session.created_at_utc,
                last_used_at: last_utc,
                host_port: session.host_port,
            });
        }
        out
    }

    /// Run `code` inside the session, dispatching to the variant matching its
    /// configured language.
    pub async fn execute(
        &self,
        id: &str,
        code: &str,
        limits: Option<ExecuteLimits>,
    ) -> Result<ExecuteOutcome> {
        if code.trim().is_empty() {
            return Err(SandboxError::InvalidArgument(
                "code must not be empty".to_string(),
            ));
        }

        let slot = self.get_execute_lock(id).await;
        let _permit = match slot.mutex.try_lock() {
            Ok(permit) => permit,
            Err(_) => {
                // Already occupied: one caller may queue behind it, a second
                // concurrent caller is rejected outright.
                if slot
                    .waiting
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(SandboxError::SessionBusy(id.to_string()));
                }
                let permit = slot.mutex.lock().await;
                slot.waiting.store(false, Ordering::SeqCst);
                permit
            }
        };

        let session = self.find(id).await?;
        session.touch().await;

        // Race the call against a close-requested signal so a concurrent
        // `close` can preempt it rather than block until it finishes.
        let mut cancel_rx = slot.cancel_rx.clone();
        let work = async {
            if session.language.is_persistent() {
                self.execute_persistent(&session, code, limits).await
            } else {
                engine::run_one_shot(self.runtime.as_ref(), &session.handle, code, limits).await
            }
        };
        tokio::pin!(work);

        tokio::select! {
            result = &mut work => {
                session.touch().await;
                result
            }
            _ = cancel_rx.changed() => {
                // `close` is tearing this session down; don't touch it, and
                // drop `work` (and the permit once we return) so `close`
                // isn't left waiting for it to finish on its own.
                Err(SandboxError::SessionCrashed(id.to_string()))
            }
        }
    }

    async fn execute_persistent(
        &self,
        session: &Session,
        code: &str,
        limits: Option<ExecuteLimits>,
    ) -> Result<ExecuteOutcome> {
        let Some(transport) = &session.transport else {
            return Err(SandboxError::internal(
                "persistent session has no transport",
            ));
        };
        let transport = transport.lock().await;

        match engine::run_persistent(transport.as_ref(), code, limits).await {
            Ok(outcome) => Ok(outcome),
            Err(SandboxError::EvaluatorUnreachable(msg)) => {
                match engine::classify_persistent_failure(self.runtime.as_ref(), &session.handle)
                    .await
                {
                    PersistentFailure::EvaluatorUnreachable => {
                        Err(SandboxError::EvaluatorUnreachable(msg))
                    }
                    PersistentFailure::SessionCrashed => {
                        let id = session.id.clone();
                        drop(transport);
                        self.sessions.write().await.remove(&id);
                        self.execute_locks.write().await.remove(&id);
                        let _ = self.runtime.remove(&session.handle, true).await;
                        Err(SandboxError::SessionCrashed(id))
                    }
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Tear down a session. Idempotent: closing a session that no longer
    /// exists returns `session_not_found`, never a runtime error.
    pub async fn close(&self, id: &str, force: bool) -> Result<()> {
        if !self.sessions.read().await.contains_key(id) {
            return Err(SandboxError::SessionNotFound(id.to_string()));
        }

        let slot = self.get_execute_lock(id).await;
        // Preempt an in-flight `execute` rather than waiting for it to finish
        // on its own: it sees this on its next poll and abandons its work,
        // so the lock below is freed promptly instead of after the call runs
        // to completion.
        slot.request_cancel();
        let _guard = slot.mutex.lock().await;

        let session = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get(id).cloned() else {
                return Err(SandboxError::SessionNotFound(id.to_string()));
            };
            if !force && session.last_used_at().await.elapsed() < session.idle_timeout {
                return Err(SandboxError::SessionActive(id.to_string()));
            }
            sessions.remove(id);
            session
        };

        self.execute_locks.write().await.remove(id);

        if let Err(e) = self.runtime.stop(&session.handle, Duration::from_secs(5)).await {
            warn!(session = %id, error = %e, "error stopping container during close");
        }
        if let Err(e) = self.runtime.remove(&session.handle, true).await {
            warn!(session = %id, error = %e, "error removing container during close");
        }
        info!(session = %id, "session closed");
        Ok(())
    }

    /// List immediate children of `path` inside the session's workspace.
    pub async fn list_session_files(&self, id: &str, path: &str) -> Result<Vec<FileEntry>> {
        let session = self.find(id).await?;
        let resolved = files::resolve(path)?;
        let tar_bytes = self.runtime.get_archive(&session.handle, &resolved).await?;
        let entries = files::list_entries(&tar_bytes)?;
        session.touch().await;
        Ok(entries)
    }

    /// Read a file out of the session's workspace, decoding UTF-8 with a
    /// base64 fallback for binary content.
    pub async fn read_session_file(&self, id: &str, path: &str) -> Result<FileContent> {
        let session = self.find(id).await?;
        let resolved = files::resolve(path)?;
        let tar_bytes = self.runtime.get_archive(&session.handle, &resolved).await?;
        let content = files::extract_single_file(&tar_bytes, self.config.max_file_bytes)?;
        session.touch().await;
        Ok(content)
    }

    /// Write `content` into the session's workspace, overwriting atomically.
    pub async fn write_session_file(&self, id: &str, path: &str, content: &[u8]) -> Result<()> {
        files::check_size(content.len(), self.config.max_file_bytes)?;
        let session = self.find(id).await?;
        let resolved = files::resolve(path)?;
        let relative = resolved
            .strip_prefix(files::SANDBOX_ROOT)
            .unwrap_or(&resolved)
            .trim_start_matches('/');
        let tar_bytes = files::build_single_file_tar(relative, content)?;
        self.runtime
            .put_archive(&session.handle, files::SANDBOX_ROOT, tar_bytes)
            .await?;
        session.touch().await;
        Ok(())
    }

    /// Install a package inside the session's container, gated on
    /// `package_install_network`.
    pub async fn install_package(
        &self,
        id: &str,
        package_name: &str,
        source: Option<&str>,
    ) -> Result<InstallOutcome> {
        if !self.config.package_install_network {
            return Err(SandboxError::InvalidArgument(
                "package installation is disabled (PACKAGE_INSTALL_NETWORK is not set)"
                    .to_string(),
            ));
        }
        if package_name.trim().is_empty() {
            return Err(SandboxError::InvalidArgument(
                "package_name must not be empty".to_string(),
            ));
        }

        let session = self.find(id).await?;
        let argv = install_argv(session.language, package_name, source);

        let result = self
            .runtime
            .exec(
                &session.handle,
                &argv,
                &[],
                INSTALL_TIME_BUDGET,
                INSTALL_BYTE_BUDGET,
            )
            .await?;

        session.touch().await;

        if result.timed_out {
            return Err(SandboxError::Timeout(INSTALL_TIME_BUDGET));
        }

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&result.stderr);
        if !stderr.is_empty() {
            output.push_str("\n--- stderr ---\n");
            output.push_str(&stderr);
        }

        Ok(InstallOutcome {
            output,
            exit_code: result.exit_code,
        })
    }

    /// Sweep every session idle beyond the configured timeout and close it.
    /// Runs once immediately, then on `self.config.reaper_interval`.
    pub fn start_reaper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.reaper_interval);
            loop {
                ticker.tick().await;
                self.cleanup_expired().await;
            }
        });
    }

    async fn cleanup_expired(&self) {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut ids = Vec::new();
            for session in sessions.values() {
                if session.last_used_at().await.elapsed() >= session.idle_timeout {
                    ids.push(session.id.clone());
                }
            }
            ids
        };

        for id in expired {
            match self.close(&id, true).await {
                Ok(()) => info!(session = %id, "reaped idle session"),
                Err(SandboxError::SessionNotFound(_)) => {
                    debug!(session = %id, "session already closed before reaper reached it");
                }
                Err(e) => warn!(session = %id, error = %e, "reaper failed to close session"),
            }
        }
    }
}

fn install_argv(language: Language, package_name: &str, source: Option<&str>) -> Vec<String> {
    match language {
        Language::Python => {
            let mut argv = vec![
                "pip".to_string(),
                "install".to_string(),
                "--no-input".to_string(),
            ];
            if let Some(index_url) = source {
                argv.push("--index-url".to_string());
                argv.push(index_url.to_string());
            }
            argv.push(package_name.to_string());
            argv
        }
        Language::R => {
            let repos = source.unwrap_or("https://cloud.r-project.org");
            vec![
                "Rscript".to_string(),
                "-e".to_string(),
                format!(
                    "install.packages('{package_name}', repos='{repos}')",
                    package_name = package_name.replace('\'', ""),
                    repos = repos.replace('\'', "")
                ),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeAdapter;
    use crate::runtime::ExecResult;
    use crate::transport::fake::FakeEvaluator;

    fn config(max_sessions: usize, idle_timeout: Duration) -> Arc<Config> {
        Arc::new(Config {
            idle_timeout,
            max_sessions,
            image_name: "sandbox-runtime:latest".to_string(),
            runtime_endpoint: "unix:///var/run/docker.sock".to_string(),
            per_session: crate::config::ResourceCaps {
                memory_bytes: 512 * 1024 * 1024,
                cpu_quota_micros: 100_000,
            },
            tmpfs_sizes: HashMap::new(),
            workspace_root: None,
            env_passthrough: HashMap::new(),
            log_level: "info".to_string(),
            reaper_interval: Duration::from_secs(30),
            max_file_bytes: 10 * 1024 * 1024,
            package_install_network: false,
        })
    }

    fn manager(max_sessions: usize, idle_timeout: Duration) -> (Arc<SessionManager>, Arc<FakeAdapter>) {
        let runtime = Arc::new(FakeAdapter::new(vec!["sandbox-runtime:latest".to_string()]));
        let mgr = Arc::new(SessionManager::new(
            config(max_sessions, idle_timeout),
            runtime.clone(),
        ));
        (mgr, runtime)
    }

    #[tokio::test]
    async fn allocate_and_close_one_shot() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        assert!(mgr.find(&summary.id).await.is_ok());
        mgr.close(&summary.id, false).await.unwrap();
        assert!(matches!(
            mgr.find(&summary.id).await,
            Err(SandboxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        mgr.close(&summary.id, true).await.unwrap();
        assert!(matches!(
            mgr.close(&summary.id, true).await,
            Err(SandboxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let (mgr, _runtime) = manager(2, Duration::from_secs(300));
        mgr.allocate(Language::Python, None).await.unwrap();
        mgr.allocate(Language::Python, None).await.unwrap();
        assert!(matches!(
            mgr.allocate(Language::Python, None).await,
            Err(SandboxError::CapacityExhausted(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capacity_is_enforced_under_concurrent_allocate() {
        let (mgr, _runtime) = manager(2, Duration::from_secs(300));
        let (a, b, c) = tokio::join!(
            mgr.allocate(Language::Python, None),
            mgr.allocate(Language::Python, None),
            mgr.allocate(Language::Python, None),
        );
        let results = [a, b, c];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(SandboxError::CapacityExhausted(_))))
            .count();
        assert_eq!(successes, 2, "exactly two of three concurrent creates should win the cap");
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn closing_frees_a_capacity_slot() {
        let (mgr, _runtime) = manager(1, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        mgr.close(&summary.id, true).await.unwrap();
        assert!(mgr.allocate(Language::Python, None).await.is_ok());
    }

    #[tokio::test]
    async fn close_refuses_active_session_without_force() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        assert!(matches!(
            mgr.close(&summary.id, false).await,
            Err(SandboxError::SessionActive(_))
        ));
    }

    #[tokio::test]
    async fn empty_code_is_rejected() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        assert!(matches!(
            mgr.execute(&summary.id, "   ", None).await,
            Err(SandboxError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn execute_after_close_is_session_not_found() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        mgr.close(&summary.id, true).await.unwrap();
        assert!(matches!(
            mgr.execute(&summary.id, "1+1", None).await,
            Err(SandboxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn third_concurrent_execute_is_rejected_as_busy() {
        let runtime = Arc::new(FakeAdapter::with_exec_handler(
            vec!["sandbox-runtime:latest".to_string()],
            |_argv, _stdin| {
                ExecResult {
                    stdout: b"ok".to_vec(),
                    ..ExecResult::default()
                }
            },
        ));
        let mgr = Arc::new(SessionManager::new(
            config(5, Duration::from_secs(300)),
            runtime.clone(),
        ));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();

        let id = summary.id.clone();
        let slot = mgr.get_execute_lock(&id).await;
        let _held = slot.mutex.lock().await;

        let mgr_a = mgr.clone();
        let id_a = id.clone();
        let queued = tokio::spawn(async move { mgr_a.execute(&id_a, "1+1", None).await });
        // Give the spawned call a chance to register as the one queued waiter.
        tokio::task::yield_now().await;

        let rejected = mgr.execute(&id, "1+1", None).await;
        assert!(matches!(rejected, Err(SandboxError::SessionBusy(_))));

        drop(_held);
        assert!(queued.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn idle_reaper_closes_stale_sessions() {
        let (mgr, _runtime) = manager(5, Duration::from_millis(50));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        mgr.cleanup_expired().await;
        assert!(matches!(
            mgr.execute(&summary.id, "1+1", None).await,
            Err(SandboxError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_inactive_by_default() {
        let (mgr, _runtime) = manager(5, Duration::from_millis(50));
        mgr.allocate(Language::Python, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mgr.list(false).await.len(), 0);
        assert_eq!(mgr.list(true).await.len(), 1);
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        mgr.write_session_file(&summary.id, "ok.txt", b"x").await.unwrap();
        let content = mgr.read_session_file(&summary.id, "ok.txt").await.unwrap();
        assert_eq!(content.content, "x");
    }

    #[tokio::test]
    async fn write_rejects_path_escape() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        assert!(matches!(
            mgr.write_session_file(&summary.id, "../escape.txt", b"x").await,
            Err(SandboxError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn persistent_session_state_round_trips() {
        let runtime = Arc::new(FakeAdapter::new(vec!["sandbox-runtime:latest".to_string()]));
        let mgr = Arc::new(SessionManager::new(
            config(5, Duration::from_secs(300)),
            runtime.clone(),
        ));
        // The fake runtime doesn't speak the evaluator's TCP protocol, so this
        // test exercises the registry/engine plumbing directly against a
        // FakeEvaluator transport rather than through `allocate`.
        let evaluator = FakeEvaluator::new();
        let outcome = engine::run_persistent(&evaluator, "x <- 42", None)
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.output.is_empty());

        let outcome = engine::run_persistent(&evaluator, "cat(x)", None)
            .await
            .unwrap();
        assert_eq!(outcome.output, "42");
    }

    #[tokio::test]
    async fn install_package_requires_network_flag() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr.allocate(Language::Python, None).await.unwrap();
        assert!(matches!(
            mgr.install_package(&summary.id, "requests", None).await,
            Err(SandboxError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn per_session_timeout_override_beats_the_configured_default() {
        let (mgr, _runtime) = manager(5, Duration::from_secs(300));
        let summary = mgr
            .allocate(Language::Python, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The 300s configured default would still call this session active;
        // the 20ms override means it's already idle.
        mgr.close(&summary.id, false).await.unwrap();
    }
}
