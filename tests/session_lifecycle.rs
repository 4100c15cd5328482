//! End-to-end scenarios driven against `SessionManager` with the in-memory
//! runtime and transport doubles, no real container daemon required.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox_session_mcp::config::{Config, Language, ResourceCaps};
use sandbox_session_mcp::error::SandboxError;
use sandbox_session_mcp::runtime::fake::FakeAdapter;
use sandbox_session_mcp::runtime::ExecResult;
use sandbox_session_mcp::session::engine::{self, ExecuteLimits};
use sandbox_session_mcp::session::SessionManager;
use sandbox_session_mcp::transport::fake::FakeEvaluator;

fn test_config(max_sessions: usize, idle_timeout: Duration, reaper_interval: Duration) -> Arc<Config> {
    Arc::new(Config {
        idle_timeout,
        max_sessions,
        image_name: "sandbox-runtime:latest".to_string(),
        runtime_endpoint: "unix:///var/run/docker.sock".to_string(),
        per_session: ResourceCaps {
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota_micros: 100_000,
        },
        tmpfs_sizes: HashMap::new(),
        workspace_root: None,
        env_passthrough: HashMap::new(),
        log_level: "info".to_string(),
        reaper_interval,
        max_file_bytes: 10 * 1024 * 1024,
        package_install_network: false,
    })
}

fn manager(max_sessions: usize, idle_timeout: Duration) -> (Arc<SessionManager>, Arc<FakeAdapter>) {
    let runtime = Arc::new(FakeAdapter::new(vec!["sandbox-runtime:latest".to_string()]));
    let config = test_config(max_sessions, idle_timeout, Duration::from_secs(30));
    let mgr = Arc::new(SessionManager::new(config, runtime.clone()));
    (mgr, runtime)
}

/// Persistent sessions keep evaluator-side state across separate
/// `execute_in_session` calls, unlike the one-shot Python path.
#[tokio::test]
async fn persistent_state_round_trips_across_calls() {
    let evaluator = FakeEvaluator::new();

    let assign = engine::run_persistent(&evaluator, "x <- 42", None)
        .await
        .unwrap();
    assert!(assign.success);

    let readback = engine::run_persistent(&evaluator, "cat(x)", None)
        .await
        .unwrap();
    assert!(readback.success);
    assert_eq!(readback.output, "42");
}

/// A session idle past its timeout is torn down by the background reaper
/// without any client calling `close_session`.
#[tokio::test]
async fn idle_reaper_closes_stale_sessions() {
    let runtime = Arc::new(FakeAdapter::new(vec!["sandbox-runtime:latest".to_string()]));
    let config = test_config(5, Duration::from_millis(30), Duration::from_millis(10));
    let mgr = Arc::new(SessionManager::new(config, runtime));

    let summary = mgr.allocate(Language::Python, None).await.unwrap();
    assert_eq!(mgr.list(true).await.len(), 1);

    mgr.clone().start_reaper();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(mgr.list(true).await.is_empty());
    assert!(matches!(
        mgr.execute(&summary.id, "1 + 1", None).await,
        Err(SandboxError::SessionNotFound(_))
    ));
}

/// Writes and reads are confined to `/sandbox`; anything that would lexically
/// escape it is rejected before it reaches the runtime adapter.
#[tokio::test]
async fn path_confinement_rejects_escapes_and_allows_nested_writes() {
    let (mgr, _runtime) = manager(5, Duration::from_secs(300));
    let summary = mgr.allocate(Language::Python, None).await.unwrap();

    assert!(matches!(
        mgr.write_session_file(&summary.id, "../../etc/passwd", b"pwned")
            .await,
        Err(SandboxError::InvalidPath(_))
    ));

    mgr.write_session_file(&summary.id, "nested/dir/out.txt", b"hello")
        .await
        .unwrap();
    let content = mgr
        .read_session_file(&summary.id, "nested/dir/out.txt")
        .await
        .unwrap();
    assert_eq!(content.content, "hello");

    let entries = mgr.list_session_files(&summary.id, "nested/dir").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "out.txt");
}

/// `create_session` refuses to exceed `max_sessions`, and closing a session
/// frees its slot for a new allocation.
#[tokio::test]
async fn capacity_is_enforced_and_recovered_on_close() {
    let (mgr, _runtime) = manager(2, Duration::from_secs(300));
    mgr.allocate(Language::Python, None).await.unwrap();
    let second = mgr.allocate(Language::Python, None).await.unwrap();

    assert!(matches!(
        mgr.allocate(Language::Python, None).await,
        Err(SandboxError::CapacityExhausted(_))
    ));

    mgr.close(&second.id, true).await.unwrap();
    assert!(mgr.allocate(Language::Python, None).await.is_ok());
}

/// Three simultaneous `create_session` calls at a cap of two yield exactly
/// two successes and one `capacity_exhausted`, never three successes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_at_the_cap_yield_exactly_one_rejection() {
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
    assert_eq!(successes, 2);
    assert_eq!(exhausted, 1);
    assert_eq!(mgr.list(true).await.len(), 2);
}

/// A call that runs past `max_duration_seconds` surfaces `timeout`, not a
/// successful (if slow) result.
#[tokio::test]
async fn execute_past_its_time_budget_times_out() {
    let runtime = Arc::new(FakeAdapter::with_exec_handler(
        vec!["sandbox-runtime:latest".to_string()],
        |_argv, _stdin| ExecResult {
            stdout: b"too slow".to_vec(),
            ..ExecResult::default()
        },
    ));
    let config = test_config(5, Duration::from_secs(300), Duration::from_secs(30));
    let mgr = Arc::new(SessionManager::new(config, runtime));
    let summary = mgr.allocate(Language::Python, None).await.unwrap();

    let limits = ExecuteLimits {
        max_duration_seconds: Some(1),
        max_output_bytes: None,
    };
    let outcome = mgr.execute(&summary.id, "sleep:5000", Some(limits)).await;
    assert!(matches!(outcome, Err(SandboxError::Timeout(_))));
}

/// Output past `max_output_bytes` is truncated rather than dropped or erroring.
#[tokio::test]
async fn oversized_output_is_truncated_not_rejected() {
    let big = vec![b'x'; 4096];
    let runtime = Arc::new(FakeAdapter::with_exec_handler(
        vec!["sandbox-runtime:latest".to_string()],
        move |_argv, _stdin| ExecResult {
            stdout: big.clone(),
            ..ExecResult::default()
        },
    ));
    let config = test_config(5, Duration::from_secs(300), Duration::from_secs(30));
    let mgr = Arc::new(SessionManager::new(config, runtime));
    let summary = mgr.allocate(Language::Python, None).await.unwrap();

    let limits = ExecuteLimits {
        max_duration_seconds: None,
        max_output_bytes: Some(128),
    };
    let outcome = mgr
        .execute(&summary.id, "print('x' * 4096)", Some(limits))
        .await
        .unwrap();
    assert!(outcome.output_truncated);
    assert_eq!(outcome.output.len(), 128);
}
