use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::StreamExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::errors::SandboxError;

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Captured result of a run that exited on its own within the time limit.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the lifecycle driver and the container runtime, so the
/// lifecycle is testable without a Docker daemon.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Run `command` in an isolated environment with `workdir` mounted
    /// read-write as its working directory, bounded by the configured
    /// wall-clock timeout.
    async fn run(
        &self,
        workdir: &Path,
        command: &str,
        config: &ExecutionConfig,
    ) -> Result<SandboxOutcome, SandboxError>;
}

/// Docker-backed sandbox. Each run gets a uniquely named, auto-removed
/// container; nothing is shared between runs.
pub struct DockerSandbox {
    docker: Docker,
}

impl DockerSandbox {
    /// Build a client for the configured endpoint. Connection is lazy; a
    /// dead daemon surfaces as a launch failure on the first run.
    pub fn connect(config: &ExecutionConfig) -> Result<Self, SandboxError> {
        let docker = match config.docker_host.as_deref() {
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(host) => {
                Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(SandboxError::Connect)?;
        Ok(Self { docker })
    }

    /// Advisory teardown: the run's outcome is already decided, so kill and
    /// removal errors are logged and swallowed.
    async fn cleanup(&self, name: &str) {
        if let Err(err) = self
            .docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
        {
            debug!(container = name, error = %err, "kill after failure returned error");
        }
        if let Err(err) = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!(container = name, error = %err, "remove after failure returned error");
        }
    }

    async fn collect_logs(
        &self,
        name: &str,
        stdout: bool,
        stderr: bool,
    ) -> Result<String, SandboxError> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout,
                stderr,
                ..Default::default()
            }),
        );
        let mut buffer = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => match output {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => buffer.extend_from_slice(&message),
                    LogOutput::StdIn { .. } => {}
                },
                Err(err) if is_not_found(&err) => return Err(SandboxError::Vanished),
                Err(err) => return Err(SandboxError::Logs(err)),
            }
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl SandboxRunner for DockerSandbox {
    async fn run(
        &self,
        workdir: &Path,
        command: &str,
        config: &ExecutionConfig,
    ) -> Result<SandboxOutcome, SandboxError> {
        let name = format!("codehive-exec-{}", Uuid::new_v4());
        let bind = format!("{}:{}:rw", workdir.display(), config.bind_path);
        let env: Vec<String> = config
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let container_config = Config::<String> {
            image: Some(config.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            env: Some(env),
            working_dir: Some(config.bind_path.clone()),
            host_config: Some(HostConfig {
                binds: Some(vec![bind]),
                auto_remove: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.as_str(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(SandboxError::Launch)?;

        if let Err(err) = self
            .docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            self.cleanup(&name).await;
            return Err(SandboxError::Launch(err));
        }
        info!(container = %name, image = %config.image, "sandbox container started");

        let deadline = Duration::from_secs(config.timeout_secs);
        let waited = tokio::time::timeout(deadline, async {
            self.docker
                .wait_container(&name, None::<WaitContainerOptions<String>>)
                .next()
                .await
        })
        .await;

        let exit_code = match waited {
            Err(_elapsed) => {
                self.cleanup(&name).await;
                return Err(SandboxError::Timeout(config.timeout_secs));
            }
            // The wait stream ending without a response means the container
            // was reaped out from under us.
            Ok(None) => return Err(SandboxError::Vanished),
            Ok(Some(Ok(response))) => response.status_code,
            // bollard reports non-zero exits through the error channel.
            Ok(Some(Err(DockerError::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(err))) if is_not_found(&err) => return Err(SandboxError::Vanished),
            Ok(Some(Err(err))) => {
                self.cleanup(&name).await;
                return Err(SandboxError::Wait(err));
            }
        };

        // With auto-remove on, the container can disappear between wait and
        // log collection; that surfaces here as a 404 → Vanished.
        let stdout = self.collect_logs(&name, true, false).await?;
        let stderr = self.collect_logs(&name, false, true).await?;
        debug!(container = %name, exit_code, "sandbox container finished");

        Ok(SandboxOutcome {
            exit_code,
            stdout,
            stderr,
        })
    }
}

// ── Test support ─────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        assert!(is_not_found(&DockerError::DockerResponseServerError {
            status_code: 404,
            message: "gone".to_string(),
        }));
        assert!(!is_not_found(&DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        }));
    }

    #[test]
    fn test_connect_builds_client_for_tcp_host() {
        let config = ExecutionConfig {
            docker_host: Some("tcp://127.0.0.1:2375".to_string()),
            ..Default::default()
        };
        // Connection is lazy, so building the client must succeed even with
        // no daemon listening.
        assert!(DockerSandbox::connect(&config).is_ok());
    }
}
