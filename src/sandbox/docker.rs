use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::ContainerStateStatusEnum;
use bollard::service::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::StreamExt;
use tracing::{debug, info};

use super::security::SandboxSpec;
use super::{ExecChannel, ExecRequest, Sandbox, SandboxError, SandboxRuntime, SandboxStatus};
use crate::config::DockerConfig;

/// Seconds Docker waits after SIGTERM before killing a stopping sandbox.
const STOP_GRACE_SECS: i64 = 10;

/// Seconds the HTTP client waits on a single Docker API call.
const CLIENT_TIMEOUT_SECS: u64 = 120;

/// Sandbox runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime").finish_non_exhaustive()
    }
}

impl DockerRuntime {
    /// Connect to the daemon described by `config` and verify it answers.
    pub async fn connect(config: &DockerConfig) -> Result<Self, SandboxError> {
        let docker = match config.base_url.as_deref() {
            Some(url) if url.starts_with("tcp://") || url.starts_with("http://") => {
                Docker::connect_with_http(url, CLIENT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(url) => Docker::connect_with_unix(
                url.trim_start_matches("unix://"),
                CLIENT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            None if config.socket_path.exists() => Docker::connect_with_unix(
                &config.socket_path.to_string_lossy(),
                CLIENT_TIMEOUT_SECS,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| SandboxError::docker_unavailable(e.to_string()))?;

        // Check if Docker is accessible
        docker
            .ping()
            .await
            .map_err(|e| SandboxError::docker_unavailable(format!("cannot ping daemon: {e}")))?;

        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Fail early when the sandbox image has not been built.
    pub async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        self.docker
            .inspect_image(image)
            .await
            .map(|_| ())
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::image_not_found(image),
                other => SandboxError::docker_unavailable(other.to_string()),
            })
    }
}

/// Convert translated sandbox parameters into a Docker container config
fn container_config(spec: &SandboxSpec) -> ContainerConfig<String> {
    ContainerConfig {
        image: Some(spec.image.clone()),
        labels: Some(spec.labels.clone()),
        // Keep stdin open for exec; the TTY is attached per exec, not at startup
        open_stdin: Some(true),
        tty: Some(false),
        host_config: Some(HostConfig {
            network_mode: Some(spec.network_mode.clone()),
            memory: Some(spec.memory_bytes),
            cpu_quota: Some(spec.cpu_quota),
            cpu_period: Some(spec.cpu_period),
            pids_limit: Some(spec.pids_limit),
            tmpfs: Some(spec.tmpfs.clone()),
            security_opt: Some(spec.security_opt.clone()),
            cap_add: Some(spec.cap_add.clone()),
            cap_drop: Some(spec.cap_drop.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<Sandbox, SandboxError> {
        debug!("Creating container: {}", spec.name);
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config(spec),
            )
            .await
            .map_err(|e| match e {
                DockerError::DockerResponseServerError {
                    status_code: 404, ..
                } => SandboxError::image_not_found(&spec.image),
                other => SandboxError::create_failed(other.to_string()),
            })?;

        Ok(Sandbox::new(created.id, spec.name.clone()))
    }

    async fn start(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
        debug!("Starting container {}", sandbox);
        self.docker
            .start_container::<String>(&sandbox.id, None)
            .await
            .map_err(|e| SandboxError::create_failed(format!("failed to start: {e}")))
    }

    async fn exec(
        &self,
        sandbox: &Sandbox,
        request: &ExecRequest,
    ) -> Result<ExecChannel, SandboxError> {
        let env = request
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let exec = self
            .docker
            .create_exec(
                &sandbox.id,
                CreateExecOptions {
                    cmd: Some(request.cmd.clone()),
                    env: Some(env),
                    user: Some(request.user.clone()),
                    working_dir: Some(request.working_dir.clone()),
                    tty: Some(request.tty),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SandboxError::exec_failed(format!("failed to create exec: {e}")))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: request.tty,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| SandboxError::exec_failed(format!("failed to start exec: {e}")))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .map(|chunk| match chunk {
                        Ok(
                            LogOutput::StdOut { message }
                            | LogOutput::StdErr { message }
                            | LogOutput::Console { message }
                            | LogOutput::StdIn { message },
                        ) => Ok(message),
                        Err(e) => Err(std::io::Error::other(e)),
                    })
                    .boxed();
                Ok(ExecChannel { output, input })
            }
            StartExecResults::Detached => Err(SandboxError::exec_failed(
                "exec started detached, no stream to attach",
            )),
        }
    }

    async fn stop(&self, sandbox: &Sandbox) -> Result<(), SandboxError> {
        debug!("Stopping container {}", sandbox);
        self.docker
            .stop_container(&sandbox.id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
            .map_err(|e| SandboxError::stop_failed(e.to_string()))
    }

    async fn inspect(&self, sandbox: &Sandbox) -> Result<SandboxStatus, SandboxError> {
        let inspected = self
            .docker
            .inspect_container(&sandbox.id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| SandboxError::inspect_failed(e.to_string()))?;

        let status = match inspected.state.and_then(|state| state.status) {
            Some(ContainerStateStatusEnum::RUNNING) => SandboxStatus::Running,
            Some(
                ContainerStateStatusEnum::EXITED
                | ContainerStateStatusEnum::DEAD
                | ContainerStateStatusEnum::CREATED,
            ) => SandboxStatus::Stopped,
            _ => SandboxStatus::Unknown,
        };
        Ok(status)
    }
}
