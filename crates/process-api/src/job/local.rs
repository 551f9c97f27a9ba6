// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs executed as containers on the local runtime.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::core::{JobCore, LogLevel};
use super::logs::extract_results;
use super::state::JobStatus;
use super::{Job, JobSettings};
use crate::backend::{ContainerBackend, ContainerSpec, with_timeout};
use crate::error::{Error, Result};
use crate::metadata::JobMetadata;

/// One container run, end to end.
pub struct LocalContainerJob {
    core: JobCore,
    backend: Arc<dyn ContainerBackend>,
    settings: JobSettings,
}

impl LocalContainerJob {
    /// Wrap `core`. Nothing touches the runtime until [`Job::create`].
    pub fn new(core: JobCore, backend: Arc<dyn ContainerBackend>, settings: JobSettings) -> Self {
        Self {
            core,
            backend,
            settings,
        }
    }

    async fn execute(&self) -> Result<()> {
        let spec = self.core.spec();
        let timeout = self.settings.backend_timeout;

        for volume in spec.volume_names() {
            with_timeout(timeout, "ensure volume", self.backend.ensure_volume(volume)).await?;
        }
        // Pulls are bounded by image size, not by the backend timeout.
        self.backend.ensure_image(&spec.image).await?;
        if self.core.cancel_token().is_cancelled() {
            return Ok(());
        }

        let container = ContainerSpec {
            name: self.core.id().to_string(),
            image: spec.image.clone(),
            command: spec.command.clone(),
            env: spec.resolve_env(),
            volumes: spec.volumes.clone(),
            resources: spec.resources,
        };
        let container_id =
            with_timeout(timeout, "run container", self.backend.run_container(&container)).await?;
        self.core.set_handle(&container_id);
        if self.core.cancel_token().is_cancelled() {
            // Killed while the container was starting.
            with_timeout(timeout, "kill container", self.backend.kill_and_remove(&container_id))
                .await?;
            return Ok(());
        }
        self.core.transition(JobStatus::Running, None).await;

        let exit_code = tokio::select! {
            biased;
            _ = self.core.cancel_token().cancelled() => {
                debug!(job_id = %self.core.id(), "Container wait abandoned");
                return Ok(());
            }
            code = self.backend.wait_container(&container_id) => code?,
        };

        self.capture(&container_id).await;
        if let Err(e) = with_timeout(
            timeout,
            "remove container",
            self.backend.remove_container(&container_id),
        )
        .await
        {
            self.core
                .log(LogLevel::Warn, format!("Failed to remove container: {e}"));
        }

        if exit_code != 0 {
            self.core.log(
                LogLevel::Error,
                format!("container failure, exit code: {exit_code}"),
            );
            self.core.transition(JobStatus::Failed, None).await;
            return Ok(());
        }

        match extract_results(&self.core.container_logs()) {
            Ok(results) => self.core.set_results(results),
            Err(e) => self.core.log(LogLevel::Warn, e.to_string()),
        }
        self.core.transition(JobStatus::Successful, None).await;
        Ok(())
    }

    /// Copy logs and timing off the container before it goes away.
    async fn capture(&self, container_id: &str) {
        let timeout = self.settings.backend_timeout;
        match with_timeout(
            timeout,
            "container logs",
            self.backend.container_logs(container_id),
        )
        .await
        {
            Ok(lines) => self.core.set_container_logs(lines),
            Err(e) => self
                .core
                .log(LogLevel::Warn, format!("Failed to fetch container logs: {e}")),
        }
        match with_timeout(
            timeout,
            "container times",
            self.backend.container_times(container_id),
        )
        .await
        {
            Ok(times) => self.core.set_times(times),
            Err(e) => debug!(job_id = %self.core.id(), error = %e, "No container timing"),
        }
    }
}

#[async_trait]
impl Job for LocalContainerJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn create(&self) -> Result<()> {
        self.core.spec().validate()?;
        let timeout = self.settings.backend_timeout;

        with_timeout(timeout, "ping", self.backend.ping())
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        if self.settings.pull_image_on_create {
            self.backend
                .ensure_image(&self.core.spec().image)
                .await
                .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
        }

        self.core.persist_initial().await?;
        self.core.log(LogLevel::Info, "Job created.");
        Ok(())
    }

    async fn run(&self) {
        if let Err(e) = self.execute().await {
            self.core
                .log(LogLevel::Error, format!("Failed to run container: {e}"));
            self.core.transition(JobStatus::Failed, None).await;
        }
    }

    async fn kill(&self) -> Result<()> {
        let status = self.core.status();
        if status.is_terminal() {
            return Err(Error::InvalidState {
                job_id: self.core.id(),
                status,
            });
        }
        if !self
            .core
            .transition(JobStatus::Dismissed, None)
            .await
            .applied()
        {
            return Err(Error::InvalidState {
                job_id: self.core.id(),
                status: self.core.status(),
            });
        }
        self.core.log(LogLevel::Info, "Received dismiss signal.");
        self.core.cancel();

        if let Some(container_id) = self.core.handle() {
            self.capture(&container_id).await;
            if let Err(e) = with_timeout(
                self.settings.backend_timeout,
                "kill container",
                self.backend.kill_and_remove(&container_id),
            )
            .await
            {
                self.core
                    .log(LogLevel::Warn, format!("Failed to stop container: {e}"));
            }
        }
        Ok(())
    }

    async fn refresh_logs(&self) -> Result<()> {
        let Some(container_id) = self.core.handle() else {
            return Ok(());
        };
        let timeout = self.settings.backend_timeout;
        if !with_timeout(
            timeout,
            "container exists",
            self.backend.container_exists(&container_id),
        )
        .await?
        {
            return Ok(());
        }
        let lines = with_timeout(
            timeout,
            "container logs",
            self.backend.container_logs(&container_id),
        )
        .await?;
        self.core.set_container_logs(lines);
        Ok(())
    }

    async fn close(&self) {
        self.core.cancel();
        let Some(container_id) = self.core.handle() else {
            return;
        };
        let timeout = self.settings.backend_timeout;
        match with_timeout(
            timeout,
            "container exists",
            self.backend.container_exists(&container_id),
        )
        .await
        {
            Ok(true) => {
                self.capture(&container_id).await;
                if let Err(e) = with_timeout(
                    timeout,
                    "kill container",
                    self.backend.kill_and_remove(&container_id),
                )
                .await
                {
                    warn!(job_id = %self.core.id(), error = %e, "Failed to remove container on close");
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(job_id = %self.core.id(), error = %e, "Could not inspect container on close")
            }
        }
    }

    async fn metadata(&self) -> Result<JobMetadata> {
        let spec = self.core.spec();
        let digest = with_timeout(
            self.settings.backend_timeout,
            "image digest",
            self.backend.image_digest(&spec.image),
        )
        .await?;
        Ok(JobMetadata::new(
            self.core.id(),
            spec,
            &spec.image,
            digest,
            self.core.times(),
        ))
    }
}
