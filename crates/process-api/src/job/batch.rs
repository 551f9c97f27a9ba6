// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs submitted to a remote batch service and tracked by polling.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::core::{JobCore, LogLevel};
use super::spec::HostSpec;
use super::state::JobStatus;
use super::{Job, JobSettings};
use crate::backend::{BackendError, BatchBackend, BatchSubmission, with_timeout};
use crate::error::{Error, Result};
use crate::metadata::JobMetadata;

/// Reason attached to cancel and terminate calls.
pub const DISMISS_REASON: &str = "dismissed";

/// Map a remote status onto the local state machine.
///
/// Returns `None` for states this server does not track.
pub fn map_remote_status(status: &str, reason: Option<&str>) -> Option<JobStatus> {
    match status {
        "SUBMITTED" | "PENDING" | "RUNNABLE" => Some(JobStatus::Accepted),
        "STARTING" | "RUNNING" => Some(JobStatus::Running),
        "SUCCEEDED" => Some(JobStatus::Successful),
        "FAILED"
            if reason.is_some_and(|r| r.to_ascii_lowercase().contains(DISMISS_REASON)) =>
        {
            Some(JobStatus::Dismissed)
        }
        "FAILED" => Some(JobStatus::Failed),
        _ => None,
    }
}

/// One remote batch job.
pub struct RemoteBatchJob {
    core: JobCore,
    backend: Arc<dyn BatchBackend>,
    settings: JobSettings,
    log_stream: Mutex<Option<String>>,
}

impl RemoteBatchJob {
    /// Wrap `core`. Nothing is submitted until [`Job::create`].
    pub fn new(core: JobCore, backend: Arc<dyn BatchBackend>, settings: JobSettings) -> Self {
        Self {
            core,
            backend,
            settings,
            log_stream: Mutex::new(None),
        }
    }

    fn target(&self) -> Result<(&str, &str)> {
        match &self.core.spec().host {
            HostSpec::AwsBatch {
                job_definition,
                job_queue,
            } => Ok((job_definition.as_str(), job_queue.as_str())),
            HostSpec::Local => Err(Error::InvalidSpec(
                "batch job without a batch target".to_string(),
            )),
        }
    }

    fn log_stream(&self) -> Option<String> {
        self.log_stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_log_stream(&self, stream: String) {
        *self
            .log_stream
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(stream);
    }

    fn batch_id(&self) -> std::result::Result<String, BackendError> {
        self.core
            .handle()
            .ok_or_else(|| BackendError::NotFound(format!("batch id of job {}", self.core.id())))
    }

    /// One log fetch. A stream that does not exist (yet) reads as empty.
    async fn fetch_logs(&self) -> std::result::Result<Vec<String>, BackendError> {
        let timeout = self.settings.backend_timeout;
        let stream = match self.log_stream() {
            Some(stream) => stream,
            None => {
                let batch_id = self.batch_id()?;
                let description =
                    with_timeout(timeout, "describe job", self.backend.describe_job(&batch_id))
                        .await?;
                match description.log_stream {
                    Some(stream) => {
                        self.set_log_stream(stream.clone());
                        stream
                    }
                    None => return Ok(Vec::new()),
                }
            }
        };

        match with_timeout(timeout, "log events", self.backend.log_events(&stream)).await {
            Err(BackendError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Cancel a queued job or terminate a started one.
    ///
    /// Returns the remote outcome instead when the job already finished.
    async fn stop_remote(
        &self,
        batch_id: &str,
    ) -> std::result::Result<Option<JobStatus>, BackendError> {
        let timeout = self.settings.backend_timeout;
        let description =
            with_timeout(timeout, "describe job", self.backend.describe_job(batch_id)).await?;
        match description.status.as_str() {
            "SUBMITTED" | "PENDING" | "RUNNABLE" => {
                with_timeout(
                    timeout,
                    "cancel job",
                    self.backend.cancel_job(batch_id, DISMISS_REASON),
                )
                .await?;
                Ok(None)
            }
            "STARTING" | "RUNNING" => {
                with_timeout(
                    timeout,
                    "terminate job",
                    self.backend.terminate_job(batch_id, DISMISS_REASON),
                )
                .await?;
                Ok(None)
            }
            remote => Ok(
                map_remote_status(remote, description.status_reason.as_deref())
                    .filter(|status| status.is_terminal()),
            ),
        }
    }

    async fn poll_once(&self, batch_id: &str, last_seen: &mut Option<String>) {
        let description = match with_timeout(
            self.settings.backend_timeout,
            "describe job",
            self.backend.describe_job(batch_id),
        )
        .await
        {
            Ok(description) => description,
            Err(e) => {
                self.core
                    .log(LogLevel::Warn, format!("Failed to describe batch job: {e}"));
                return;
            }
        };

        if let Some(stream) = description.log_stream.clone() {
            self.set_log_stream(stream);
        }
        self.core.set_times(description.times);

        if last_seen.as_deref() == Some(description.status.as_str()) {
            return;
        }
        *last_seen = Some(description.status.clone());

        let Some(next) =
            map_remote_status(&description.status, description.status_reason.as_deref())
        else {
            debug!(
                job_id = %self.core.id(),
                remote_status = %description.status,
                "Ignoring untracked remote status"
            );
            return;
        };
        if next != self.core.status() {
            self.core.transition(next, None).await;
        }
    }
}

#[async_trait]
impl Job for RemoteBatchJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    async fn create(&self) -> Result<()> {
        let spec = self.core.spec();
        spec.validate()?;
        let (job_definition, job_queue) = self.target()?;

        let submission = BatchSubmission {
            name: format!("{}_{}", self.settings.server_name, self.core.id()),
            job_definition: job_definition.to_string(),
            job_queue: job_queue.to_string(),
            command: spec.command.clone(),
            env: spec.resolve_env(),
        };
        let batch_id = with_timeout(
            self.settings.backend_timeout,
            "submit job",
            self.backend.submit_job(&submission),
        )
        .await?;
        self.core.set_handle(&batch_id);

        self.core.persist_initial().await?;
        self.core.log(
            LogLevel::Info,
            format!("Job submitted with batch id {batch_id}."),
        );
        Ok(())
    }

    async fn run(&self) {
        let batch_id = match self.batch_id() {
            Ok(id) => id,
            Err(e) => {
                self.core.log(LogLevel::Error, e.to_string());
                self.core.transition(JobStatus::Failed, None).await;
                return;
            }
        };

        let mut last_seen = None;
        while !self.core.status().is_terminal() {
            tokio::select! {
                biased;
                _ = self.core.cancel_token().cancelled() => break,
                _ = tokio::time::sleep(self.settings.batch_poll_interval) => {
                    self.poll_once(&batch_id, &mut last_seen).await;
                }
            }
        }
        debug!(job_id = %self.core.id(), "Polling stopped");
    }

    async fn kill(&self) -> Result<()> {
        let status = self.core.status();
        if status.is_terminal() {
            return Err(Error::InvalidState {
                job_id: self.core.id(),
                status,
            });
        }
        self.core.log(LogLevel::Info, "Received dismiss signal.");

        if let Some(batch_id) = self.core.handle() {
            match self.stop_remote(&batch_id).await {
                Ok(Some(outcome)) if outcome != JobStatus::Dismissed => {
                    // The remote job finished first; record its outcome.
                    self.core.transition(outcome, None).await;
                    self.core.cancel();
                    return Err(Error::InvalidState {
                        job_id: self.core.id(),
                        status: self.core.status(),
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    self.core.log(
                        LogLevel::Error,
                        format!("Could not send kill signal to batch service: {e}"),
                    );
                    return Err(Error::BackendUnavailable(e.to_string()));
                }
            }
        }

        // The poller may observe the stopped remote job first.
        let applied = self
            .core
            .transition(JobStatus::Dismissed, None)
            .await
            .applied();
        let status = self.core.status();
        if !applied && status != JobStatus::Dismissed {
            return Err(Error::InvalidState {
                job_id: self.core.id(),
                status,
            });
        }
        self.core.cancel();
        Ok(())
    }

    async fn refresh_logs(&self) -> Result<()> {
        let lines = self.fetch_logs().await?;
        self.core.set_container_logs(lines);
        Ok(())
    }

    async fn close(&self) {
        self.core.cancel();

        let attempts = self.settings.log_fetch_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.fetch_logs().await {
                Ok(lines) => {
                    self.core.set_container_logs(lines);
                    return;
                }
                Err(e) => {
                    debug!(job_id = %self.core.id(), attempt, error = %e, "Log fetch failed");
                    last_error = Some(e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.log_fetch_backoff * attempt).await;
            }
        }

        if let Some(e) = last_error {
            let err = Error::LogFetch {
                attempts,
                reason: e.to_string(),
            };
            self.core.log(LogLevel::Warn, err.to_string());
        }
    }

    async fn metadata(&self) -> Result<JobMetadata> {
        let (job_definition, _) = self.target()?;
        let timeout = self.settings.backend_timeout;
        let definition = with_timeout(
            timeout,
            "describe job definition",
            self.backend.describe_job_definition(job_definition),
        )
        .await?;

        let batch_id = self.batch_id()?;
        let times = match with_timeout(timeout, "describe job", self.backend.describe_job(&batch_id))
            .await
        {
            Ok(description) => description.times,
            Err(e) => {
                debug!(job_id = %self.core.id(), error = %e, "Using cached batch timing");
                self.core.times()
            }
        };

        Ok(JobMetadata::new(
            self.core.id(),
            self.core.spec(),
            definition.image,
            None,
            times,
        ))
    }
}
