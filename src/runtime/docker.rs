//! Docker-engine-compatible [`RuntimeAdapter`] implementation.
//!
//! Talks to the daemon named by `DOCKER_HOST` via `bollard`. One `Docker`
//! client handle is shared across every session; the adapter itself carries
//! no per-session state.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount as BollardMount, MountTypeEnum, PortBinding as BollardPortBinding};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::{
    classify_daemon_error, ContainerHandle, ContainerSpec, ExecResult, InspectResult, MountSpec,
    RuntimeAdapter,
};
use crate::error::{Result, SandboxError};

/// Fixed in-container port the persistent evaluator listens on.
const EVALUATOR_PORT: u16 = 8765;

pub struct DockerAdapter {
    client: Docker,
}

impl DockerAdapter {
    /// Connect to the daemon at `endpoint` (a `unix://` or `tcp://` URI, the
    /// value of `DOCKER_HOST`).
    pub fn connect(endpoint: &str) -> Result<Self> {
        let client = if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(endpoint, 120, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| classify_daemon_error("connect", e))?;

        Ok(Self { client })
    }

    fn host_config(spec: &ContainerSpec) -> HostConfig {
        let mounts = spec
            .mounts
            .iter()
            .map(|m| match m {
                MountSpec::Bind {
                    host_path,
                    container_path,
                } => BollardMount {
                    target: Some(container_path.clone()),
                    source: Some(host_path.clone()),
                    typ: Some(MountTypeEnum::BIND),
                    read_only: Some(false),
                    ..Default::default()
                },
                MountSpec::Tmpfs {
                    container_path,
                    size_bytes,
                } => BollardMount {
                    target: Some(container_path.clone()),
                    typ: Some(MountTypeEnum::TMPFS),
                    tmpfs_options: Some(bollard::models::MountTmpfsOptions {
                        size_bytes: Some(i64::try_from(*size_bytes).unwrap_or(i64::MAX)),
                        mode: Some(0o1777),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            })
            .collect();

        let mut port_bindings = HashMap::new();
        for binding in &spec.port_bindings {
            port_bindings.insert(
                format!("{}/tcp", binding.container_port),
                Some(vec![BollardPortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(String::new()), // let the daemon pick an ephemeral host port
                }]),
            );
        }

        HostConfig {
            memory: Some(spec.resources.memory_bytes),
            cpu_quota: Some(spec.resources.cpu_quota_micros),
            cpu_period: Some(100_000),
            readonly_rootfs: Some(spec.security.read_only_root),
            cap_drop: if spec.security.drop_all_capabilities {
                Some(vec!["ALL".to_string()])
            } else {
                None
            },
            security_opt: if spec.security.no_new_privileges {
                Some(vec!["no-new-privileges".to_string()])
            } else {
                None
            },
            network_mode: if spec.security.network_disabled {
                Some("none".to_string())
            } else {
                None
            },
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            publish_all_ports: Some(!spec.port_bindings.is_empty()),
            ..Default::default()
        }
    }

    /// Best-effort kill of a timed-out exec's process. Docker has no
    /// "kill exec" endpoint, so this looks up the exec's pid (visible inside
    /// the container's pid namespace) via `inspect_exec` and runs a second,
    /// detached exec to signal it.
    async fn kill_exec(&self, handle: &ContainerHandle, exec_id: &str) {
        let pid = match self.client.inspect_exec(exec_id).await {
            Ok(inspect) => inspect.pid,
            Err(e) => {
                warn!(error = %e, "failed to inspect timed-out exec for kill");
                return;
            }
        };
        let Some(pid) = pid.filter(|&p| p > 0) else {
            warn!("timed-out exec has no pid, cannot signal it");
            return;
        };

        let kill_options = CreateExecOptions {
            cmd: Some(vec!["kill".to_string(), "-KILL".to_string(), pid.to_string()]),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };
        let kill_exec = match self.client.create_exec(&handle.0, kill_options).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, pid, "failed to create kill exec for timed-out process");
                return;
            }
        };
        if let Err(e) = self.client.start_exec(&kill_exec.id, None).await {
            warn!(error = %e, pid, "failed to start kill exec for timed-out process");
        }
    }
}

#[async_trait]
impl RuntimeAdapter for DockerAdapter {
    #[instrument(skip(self, spec), fields(image = %spec.image, name = %spec.name))]
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerHandle> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let exposed_ports = spec
            .port_bindings
            .iter()
            .map(|b| (format!("{}/tcp", b.container_port), HashMap::new()))
            .collect();

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            user: Some(spec.security.uid.to_string()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| classify_daemon_error("create_container", e))?;

        for warning in &response.warnings {
            warn!(warning = %warning, "docker create_container warning");
        }

        Ok(ContainerHandle(response.id))
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<()> {
        self.client
            .start_container::<String>(&handle.0, None)
            .await
            .map_err(|e| classify_daemon_error("start_container", e))
    }

    async fn stop(&self, handle: &ContainerHandle, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
        };
        match self.client.stop_container(&handle.0, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify_daemon_error("stop_container", e)),
        }
    }

    async fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(&handle.0, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(classify_daemon_error("remove_container", e)),
        }
    }

    async fn inspect(&self, handle: &ContainerHandle) -> Result<InspectResult> {
        let info = self
            .client
            .inspect_container(&handle.0, None)
            .await
            .map_err(|e| classify_daemon_error("inspect_container", e))?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let host_port = info
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
            .and_then(|ports| ports.get(&format!("{EVALUATOR_PORT}/tcp")))
            .and_then(|bindings| bindings.as_ref())
            .and_then(|bindings| bindings.first())
            .and_then(|b| b.host_port.clone())
            .and_then(|p| p.parse::<u16>().ok());

        Ok(InspectResult {
            running,
            host_ports: vec![host_port],
        })
    }

    #[instrument(skip(self, argv, stdin), fields(container = %handle.0))]
    async fn exec(
        &self,
        handle: &ContainerHandle,
        argv: &[String],
        stdin: &[u8],
        time_budget: Duration,
        byte_budget: usize,
    ) -> Result<ExecResult> {
        let create_options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdin: Some(!stdin.is_empty()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(&handle.0, create_options)
            .await
            .map_err(|e| classify_daemon_error("create_exec", e))?;

        let run = async {
            let start = self
                .client
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| classify_daemon_error("start_exec", e))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut stdout_truncated = false;
            let mut stderr_truncated = false;

            if let StartExecResults::Attached { mut output, mut input } = start {
                if !stdin.is_empty() {
                    let _ = input.write_all(stdin).await;
                    drop(input);
                }

                while let Some(chunk) = output.next().await {
                    let chunk = chunk.map_err(|e| classify_daemon_error("exec_stream", e))?;
                    match chunk {
                        bollard::container::LogOutput::StdOut { message } => {
                            if stdout.len() < byte_budget {
                                let remaining = byte_budget - stdout.len();
                                if message.len() > remaining {
                                    stdout.extend_from_slice(&message[..remaining]);
                                    stdout_truncated = true;
                                } else {
                                    stdout.extend_from_slice(&message);
                                }
                            } else {
                                stdout_truncated = true;
                            }
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            if stderr.len() < byte_budget {
                                let remaining = byte_budget - stderr.len();
                                if message.len() > remaining {
                                    stderr.extend_from_slice(&message[..remaining]);
                                    stderr_truncated = true;
                                } else {
                                    stderr.extend_from_slice(&message);
                                }
                            } else {
                                stderr_truncated = true;
                            }
                        }
                        _ => {}
                    }
                }
            }

            let inspect = self
                .client
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| classify_daemon_error("inspect_exec", e))?;

            Result::Ok(ExecResult {
                stdout,
                stderr,
                exit_code: inspect.exit_code.unwrap_or(-1) as i32,
                stdout_truncated,
                stderr_truncated,
                timed_out: false,
            })
        };

        match tokio::time::timeout(time_budget, run).await {
            Ok(result) => result,
            Err(_) => {
                debug!("exec exceeded time budget, signaling process");
                self.kill_exec(handle, &exec.id).await;
                Ok(ExecResult {
                    timed_out: true,
                    ..ExecResult::default()
                })
            }
        }
    }

    async fn put_archive(
        &self,
        handle: &ContainerHandle,
        in_container_path: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let options = UploadToContainerOptions {
            path: in_container_path.to_string(),
            no_overwrite_dir_non_dir: String::new(),
        };
        self.client
            .upload_to_container(&handle.0, Some(options), bytes.into())
            .await
            .map_err(|e| classify_daemon_error("upload_to_container", e))
    }

    async fn get_archive(
        &self,
        handle: &ContainerHandle,
        in_container_path: &str,
    ) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: in_container_path.to_string(),
        };
        let mut stream = self.client.download_from_container(&handle.0, Some(options));
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_daemon_error("download_from_container", e))?;
            buf.extend_from_slice(&chunk);
        }
        if buf.is_empty() {
            return Err(SandboxError::InvalidPath(in_container_path.to_string()));
        }
        Ok(buf)
    }
}
