//! Configuration loaded once at startup from the process environment.
//!
//! Mirrors the variable names in the system's operating contract: `SANDBOX_TIMEOUT`,
//! `MAX_SANDBOXES`, `DOCKER_IMAGE`, `DOCKER_HOST`, `WORKSPACE_ROOT`, `LOG_LEVEL`,
//! the `DB_*` passthrough set, and the ambient `REAPER_INTERVAL` / `MAX_FILE_BYTES`
//! additions. Nothing here is re-read after startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Language variant a session is created against — picks the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// One-shot stateless evaluator, one process per `execute_in_session` call.
    Python,
    /// Persistent in-container evaluator, state survives across calls.
    R,
}

impl Language {
    #[must_use]
    pub const fn is_persistent(self) -> bool {
        matches!(self, Self::R)
    }
}

/// Resource caps applied at container creation, per the configuration record.
#[derive(Debug, Clone)]
pub struct ResourceCaps {
    pub memory_bytes: i64,
    pub cpu_quota_micros: i64,
}

/// A single tmpfs mount spec: size in bytes plus the `noexec,nosuid` flags the
/// security profile always applies.
#[derive(Debug, Clone)]
pub struct TmpfsSpec {
    pub size_bytes: u64,
    pub noexec: bool,
    pub nosuid: bool,
}

/// Immutable, process-wide configuration bundle. Built once in `main` via
/// [`Config::from_env`] and shared behind an `Arc`.
#[derive(Debug, Clone)]
pub struct Config {
    pub idle_timeout: Duration,
    pub max_sessions: usize,
    pub image_name: String,
    pub runtime_endpoint: String,
    pub per_session: ResourceCaps,
    pub tmpfs_sizes: HashMap<String, TmpfsSpec>,
    pub workspace_root: Option<PathBuf>,
    pub env_passthrough: HashMap<String, String>,
    pub log_level: String,
    pub reaper_interval: Duration,
    pub max_file_bytes: u64,
    pub package_install_network: bool,
}

impl Config {
    /// Load configuration from the process environment, applying defaults for
    /// anything unset. Fails only if a set variable can't be parsed.
    pub fn from_env() -> Result<Self> {
        let idle_timeout = env_duration_secs("SANDBOX_TIMEOUT", 300)?;
        let max_sessions = env_parse("MAX_SANDBOXES", 10usize)?;
        let image_name =
            std::env::var("DOCKER_IMAGE").unwrap_or_else(|_| "sandbox-runtime:latest".to_string());
        let runtime_endpoint = std::env::var("DOCKER_HOST")
            .unwrap_or_else(|_| "unix:///var/run/docker.sock".to_string());
        let workspace_root = std::env::var("WORKSPACE_ROOT").ok().map(PathBuf::from);
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let reaper_interval = env_duration_secs("REAPER_INTERVAL", 30)?;
        let max_file_bytes = env_parse("MAX_FILE_BYTES", 10 * 1024 * 1024u64)?;
        let package_install_network = std::env::var("PACKAGE_INSTALL_NETWORK")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let mut env_passthrough = HashMap::new();
        for key in ["DB_HOST", "DB_PORT", "DB_USER", "DB_PASSWORD", "DB_NAME"] {
            if let Ok(value) = std::env::var(key) {
                env_passthrough.insert(key.to_string(), value);
            }
        }
        if let Ok(cred) = std::env::var("PACKAGE_INSTALL_CREDENTIAL") {
            env_passthrough.insert("PACKAGE_INSTALL_CREDENTIAL".to_string(), cred);
        }

        let mut tmpfs_sizes = HashMap::new();
        tmpfs_sizes.insert(
            "/tmp".to_string(),
            TmpfsSpec {
                size_bytes: 100 * 1024 * 1024,
                noexec: true,
                nosuid: true,
            },
        );
        tmpfs_sizes.insert(
            "/sandbox".to_string(),
            TmpfsSpec {
                size_bytes: 500 * 1024 * 1024,
                noexec: true,
                nosuid: true,
            },
        );

        let config = Self {
            idle_timeout,
            max_sessions,
            image_name,
            runtime_endpoint,
            per_session: ResourceCaps {
                memory_bytes: 512 * 1024 * 1024,
                cpu_quota_micros: 100_000,
            },
            tmpfs_sizes,
            workspace_root,
            env_passthrough,
            log_level,
            reaper_interval,
            max_file_bytes,
            package_install_network,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.max_sessions > 0, "MAX_SANDBOXES must be positive");
        anyhow::ensure!(
            !self.idle_timeout.is_zero(),
            "SANDBOX_TIMEOUT must be positive"
        );
        if let Some(root) = &self.workspace_root {
            anyhow::ensure!(
                root.is_absolute(),
                "WORKSPACE_ROOT must be an absolute path, got {}",
                root.display()
            );
        }
        Ok(())
    }

    /// Host subdirectory for a session's persistent workspace, if configured.
    #[must_use]
    pub fn workspace_dir_for(&self, session_id: &str) -> Option<PathBuf> {
        self.workspace_root.as_ref().map(|root| root.join(session_id))
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("failed to parse {key}={raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "SANDBOX_TIMEOUT",
            "MAX_SANDBOXES",
            "DOCKER_IMAGE",
            "DOCKER_HOST",
            "WORKSPACE_ROOT",
            "LOG_LEVEL",
            "REAPER_INTERVAL",
            "MAX_FILE_BYTES",
            "PACKAGE_INSTALL_NETWORK",
            "DB_HOST",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        let config = Config::from_env().unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
        assert_eq!(config.max_file_bytes, 10 * 1024 * 1024);
        assert!(!config.package_install_network);
    }

    #[test]
    fn reads_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("SANDBOX_TIMEOUT", "5");
        std::env::set_var("MAX_SANDBOXES", "2");
        std::env::set_var("DB_HOST", "db.internal");
        let config = Config::from_env().unwrap();
        assert_eq!(config.idle_timeout, Duration::from_secs(5));
        assert_eq!(config.max_sessions, 2);
        assert_eq!(
            config.env_passthrough.get("DB_HOST").map(String::as_str),
            Some("db.internal")
        );
        clear_all();
    }

    #[test]
    fn rejects_relative_workspace_root() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        std::env::set_var("WORKSPACE_ROOT", "relative/path");
        assert!(Config::from_env().is_err());
        clear_all();
    }
}
