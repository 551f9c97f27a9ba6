// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status and completion pipeline.
//!
//! A single consumer drains two queues:
//!
//! - **status** - proposed transitions from callbacks and pollers
//! - **finished** - jobs whose execution task has returned
//!
//! Because one task applies every externally reported transition, two
//! reporters racing to complete a job cannot both win. Terminal cleanup is
//! additionally guarded by the job's `closed` flag:
//!
//! ```text
//! terminal ──► mark_closed() ──┬──► metadata (successful only)
//!                              └──► close ─► persist logs ─► upload logs ─► deregister
//! ```
//!
//! Metadata and close run on separate tasks so a metadata failure never
//! holds up resource release.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobStatus, LogLevel};
use crate::registry::JobRegistry;
use crate::storage::ObjectStore;
use crate::store::JobRecordStore;

/// Proposed status change for one job.
pub struct StatusMessage {
    /// Target job.
    pub job: Arc<dyn Job>,
    /// Proposed status.
    pub status: JobStatus,
    /// Reporter's timestamp; `None` stamps the processing time.
    pub updated: Option<DateTime<Utc>>,
}

/// Sending side of the pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    status_tx: mpsc::UnboundedSender<StatusMessage>,
    finished_tx: mpsc::UnboundedSender<Arc<dyn Job>>,
}

impl PipelineHandle {
    /// Queue a status change. Returns `false` once the pipeline has stopped.
    pub fn send_status(&self, message: StatusMessage) -> bool {
        self.status_tx.send(message).is_ok()
    }

    /// Report that a job's execution task has returned.
    pub fn job_finished(&self, job: Arc<dyn Job>) {
        let job_id = job.id();
        if self.finished_tx.send(job).is_err() {
            warn!(job_id = %job_id, "Pipeline stopped; finished job not cleaned up");
        }
    }
}

/// Shared pieces used by the cleanup tasks.
struct Finisher {
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobRecordStore>,
    objects: Arc<dyn ObjectStore>,
    metadata_prefix: String,
    logs_prefix: String,
}

impl Finisher {
    async fn write_metadata(&self, job: Arc<dyn Job>) {
        let job_id = job.id();
        let document = match job.metadata().await {
            Ok(document) => document,
            Err(e) => {
                job.core()
                    .log(LogLevel::Error, format!("error writing metadata: {e}"));
                return;
            }
        };
        let bytes = match serde_json::to_vec(&document) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to serialize metadata");
                return;
            }
        };

        let key = format!("{}/{job_id}.json", self.metadata_prefix);
        match self.objects.put(&key, bytes, "application/json", None).await {
            Ok(()) => debug!(job_id = %job_id, key = %key, "Metadata written"),
            Err(e) => job
                .core()
                .log(LogLevel::Error, format!("error writing metadata: {e}")),
        }
    }

    async fn close(&self, job: Arc<dyn Job>) {
        let job_id = job.id();
        job.close().await;

        let logs = job.core().logs();
        if let Err(e) = self.store.upsert_logs(&logs).await {
            error!(job_id = %job_id, error = %e, "Failed to persist job logs");
        }

        let key = format!("{}/{job_id}.json", self.logs_prefix);
        match serde_json::to_vec(&logs) {
            Ok(bytes) => {
                if let Err(e) = self.objects.put(&key, bytes, "application/json", None).await {
                    warn!(job_id = %job_id, key = %key, error = %e, "Failed to upload job logs");
                }
            }
            Err(e) => error!(job_id = %job_id, error = %e, "Failed to serialize job logs"),
        }

        self.registry.remove(job_id);
        info!(job_id = %job_id, status = %job.status(), "Job closed");
    }
}

/// Single consumer of status messages and job-finished notifications.
pub struct StatusPipeline {
    status_rx: mpsc::UnboundedReceiver<StatusMessage>,
    finished_rx: mpsc::UnboundedReceiver<Arc<dyn Job>>,
    finisher: Arc<Finisher>,
    tasks: TaskTracker,
    shutdown: Arc<Notify>,
}

impl StatusPipeline {
    /// Create the pipeline and its sending handle.
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobRecordStore>,
        objects: Arc<dyn ObjectStore>,
        metadata_prefix: impl Into<String>,
        logs_prefix: impl Into<String>,
    ) -> (Self, PipelineHandle) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let pipeline = Self {
            status_rx,
            finished_rx,
            finisher: Arc::new(Finisher {
                registry,
                store,
                objects,
                metadata_prefix: metadata_prefix.into(),
                logs_prefix: logs_prefix.into(),
            }),
            tasks: TaskTracker::new(),
            shutdown: Arc::new(Notify::new()),
        };
        let handle = PipelineHandle {
            status_tx,
            finished_tx,
        };
        (pipeline, handle)
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tracker of in-flight cleanup tasks.
    pub fn tasks(&self) -> TaskTracker {
        self.tasks.clone()
    }

    /// Consume messages until shutdown is signalled.
    pub async fn run(mut self) {
        info!("Status pipeline started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Status pipeline received shutdown signal");
                    break;
                }

                Some(message) = self.status_rx.recv() => self.apply(message).await,

                Some(job) = self.finished_rx.recv() => self.finished(job).await,

                else => break,
            }
        }

        self.tasks.close();
        info!(
            pending_cleanups = self.tasks.len(),
            "Status pipeline stopped"
        );
    }

    async fn apply(&self, message: StatusMessage) {
        let StatusMessage {
            job,
            status,
            updated,
        } = message;

        if job.status().is_terminal() {
            debug!(
                job_id = %job.id(),
                current = %job.status(),
                requested = %status,
                "Discarding update for terminal job"
            );
            return;
        }

        let applied = job.core().transition(status, updated).await.applied();
        if applied && status.is_terminal() {
            self.finish(job);
        }
    }

    async fn finished(&self, job: Arc<dyn Job>) {
        let status = job.status();
        if !status.is_terminal() && !job.core().is_closed() {
            // The record stays at its last persisted status.
            job.core().log(
                LogLevel::Error,
                format!(
                    "Job abandoned while {status}; its record stays {status} and \
                     backend resources may remain."
                ),
            );
            job.core().cancel();
        }
        self.finish(job);
    }

    fn finish(&self, job: Arc<dyn Job>) {
        if !job.core().mark_closed() {
            debug!(job_id = %job.id(), "Job already closed");
            return;
        }

        if job.status() == JobStatus::Successful {
            let finisher = self.finisher.clone();
            let job = job.clone();
            self.tasks
                .spawn(async move { finisher.write_metadata(job).await });
        }

        let finisher = self.finisher.clone();
        self.tasks.spawn(async move { finisher.close(job).await });
    }
}
