// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker Engine backend.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::volume::CreateVolumeOptions;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use super::traits::*;

/// Docker Engine API client.
pub struct DockerBackend {
    docker: Docker,
}

impl DockerBackend {
    /// Wrap an existing client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect using `DOCKER_HOST` or the platform default socket.
    pub fn connect_local() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

impl From<bollard::errors::Error> for BackendError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => BackendError::NotFound(message),
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } if (400..500).contains(&status_code) => BackendError::Rejected(message),
            bollard::errors::Error::DockerResponseServerError { message, .. } => {
                BackendError::Api(message)
            }
            other => BackendError::Unavailable(other.to_string()),
        }
    }
}

/// Docker reports unset times as the zero date.
fn parse_docker_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?.with_timezone(&Utc);
    (parsed.timestamp() > 0).then_some(parsed)
}

fn split_lines(chunk: &[u8], lines: &mut Vec<String>) {
    let text = String::from_utf8_lossy(chunk);
    lines.extend(
        text.split('\n')
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty())
            .map(str::to_string),
    );
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn backend_type(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let image = if image.contains(':') || image.contains('@') {
            image.to_string()
        } else {
            format!("{image}:latest")
        };
        if self.docker.inspect_image(&image).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "Pulling image");
        let mut stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.clone(),
                ..Default::default()
            }),
            None,
            None,
        );
        while stream.try_next().await?.is_some() {}
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<()> {
        if self.docker.inspect_volume(name).await.is_ok() {
            return Ok(());
        }
        debug!(volume = %name, "Creating volume");
        self.docker
            .create_volume(CreateVolumeOptions {
                name,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let host_config = HostConfig {
            nano_cpus: Some((spec.resources.cpus * 1e9) as i64),
            memory: Some((spec.resources.memory_mb * 1024 * 1024) as i64),
            binds: (!spec.volumes.is_empty()).then(|| spec.volumes.clone()),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            host_config: Some(host_config),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.as_str(),
                    platform: None,
                }),
                config,
            )
            .await?;
        for warning in &created.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker warning on create");
        }

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(created.id)
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits surface as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => {
                let inspect = self
                    .docker
                    .inspect_container(container_id, None::<InspectContainerOptions>)
                    .await?;
                inspect
                    .state
                    .and_then(|state| state.exit_code)
                    .ok_or_else(|| BackendError::Api("wait stream closed without exit code".into()))
            }
        }
    }

    async fn container_logs(&self, container_id: &str) -> Result<Vec<String>> {
        let mut stream = self.docker.logs(
            container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: false,
                tail: "all".to_string(),
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(chunk) = stream.try_next().await? {
            match chunk {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => split_lines(&message, &mut lines),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(lines)
    }

    async fn container_times(&self, container_id: &str) -> Result<ExecutionTimes> {
        let inspect = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;
        let state = inspect.state.unwrap_or_default();
        Ok(ExecutionTimes {
            created: parse_docker_time(inspect.created.as_deref()),
            started: parse_docker_time(state.started_at.as_deref()),
            ended: parse_docker_time(state.finished_at.as_deref()),
        })
    }

    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match BackendError::from(e) {
                BackendError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(container_id, None::<RemoveContainerOptions>)
            .await?;
        Ok(())
    }

    async fn kill_and_remove(&self, container_id: &str) -> Result<()> {
        // 409 means the container already stopped.
        match self.docker.kill_container::<String>(container_id, None).await {
            Ok(()) => {}
            Err(e) => match BackendError::from(e) {
                BackendError::NotFound(_) => return Ok(()),
                BackendError::Rejected(msg) => debug!(container = %container_id, reason = %msg, "Kill skipped"),
                other => return Err(other),
            },
        }

        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn image_digest(&self, image: &str) -> Result<Option<String>> {
        let inspect = self.docker.inspect_image(image).await?;
        Ok(inspect
            .repo_digests
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|digest| digest.split_once('@').map(|(_, d)| d.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_docker_time() {
        assert!(parse_docker_time(Some("0001-01-01T00:00:00Z")).is_none());
        assert!(parse_docker_time(None).is_none());
        let t = parse_docker_time(Some("2024-05-01T10:00:00.123456789Z")).unwrap();
        assert_eq!(t.timestamp(), 1_714_557_600);
    }

    #[test]
    fn test_split_lines() {
        let mut lines = Vec::new();
        split_lines(b"one\r\ntwo\n\n", &mut lines);
        split_lines(b"three", &mut lines);
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_error_classification() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        assert!(matches!(
            BackendError::from(not_found),
            BackendError::NotFound(_)
        ));

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "not running".into(),
        };
        assert!(matches!(
            BackendError::from(conflict),
            BackendError::Rejected(_)
        ));
    }
}
