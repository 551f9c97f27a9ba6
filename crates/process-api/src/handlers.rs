// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job handlers.
//!
//! Transport-independent operations behind the HTTP routes. Read paths
//! consult the active registry first and fall back to the record store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{BatchBackend, ContainerBackend};
use crate::error::{Error, Result};
use crate::job::logs::extract_results;
use crate::job::{
    ExecutionMode, HostSpec, Job, JobCore, JobLogs, JobSettings, JobSpec, JobStatus,
    LocalContainerJob, RemoteBatchJob,
};
use crate::pipeline::{PipelineHandle, StatusMessage};
use crate::registry::JobRegistry;
use crate::store::{JobRecord, JobRecordStore, ListJobsQuery};

/// Shared state for job handlers.
pub struct ProcessHandlerState {
    /// Active jobs.
    pub registry: Arc<JobRegistry>,
    /// Job history.
    pub store: Arc<dyn JobRecordStore>,
    /// Status pipeline.
    pub pipeline: PipelineHandle,
    /// Local container runtime.
    pub container_backend: Arc<dyn ContainerBackend>,
    /// Remote batch service, when configured.
    pub batch_backend: Option<Arc<dyn BatchBackend>>,
    /// Per-job tunables.
    pub settings: JobSettings,
    runs: TaskTracker,
    accepting: AtomicBool,
    admission: RwLock<()>,
}

impl ProcessHandlerState {
    /// Create handler state.
    pub fn new(
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobRecordStore>,
        pipeline: PipelineHandle,
        container_backend: Arc<dyn ContainerBackend>,
        batch_backend: Option<Arc<dyn BatchBackend>>,
        settings: JobSettings,
    ) -> Self {
        Self {
            registry,
            store,
            pipeline,
            container_backend,
            batch_backend,
            settings,
            runs: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            admission: RwLock::new(()),
        }
    }

    /// Refuse new submissions.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Wait for submissions admitted before [`stop_accepting`](Self::stop_accepting)
    /// to be registered and started.
    pub async fn drain_admissions(&self) {
        let _exclusive = self.admission.write().await;
    }

    /// Tracker of running execution tasks.
    pub fn runs(&self) -> TaskTracker {
        self.runs.clone()
    }

    fn build_job(&self, spec: JobSpec) -> Result<Arc<dyn Job>> {
        let id = Uuid::new_v4();
        let host = spec.host.clone();
        let core = JobCore::new(id, spec, self.store.clone());
        let job: Arc<dyn Job> = match host {
            HostSpec::Local => Arc::new(LocalContainerJob::new(
                core,
                self.container_backend.clone(),
                self.settings.clone(),
            )),
            HostSpec::AwsBatch { .. } => {
                let backend = self.batch_backend.clone().ok_or_else(|| {
                    Error::BackendUnavailable("no batch backend configured".to_string())
                })?;
                Arc::new(RemoteBatchJob::new(core, backend, self.settings.clone()))
            }
        };
        Ok(job)
    }
}

// ============================================================================
// Submission
// ============================================================================

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// New job identifier.
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    /// Status when the response was produced.
    pub status: JobStatus,
    /// Results of a synchronous job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

/// Create, register and start a job.
///
/// Synchronous jobs are awaited until terminal, or until the job is
/// cancelled without reaching a terminal status.
pub async fn handle_submit(state: &ProcessHandlerState, spec: JobSpec) -> Result<SubmitResponse> {
    // Admission ends once the job is registered and its run task spawned.
    let admitted = state.admission.read().await;
    if !state.accepting.load(Ordering::SeqCst) {
        return Err(Error::BackendUnavailable(
            "server is shutting down".to_string(),
        ));
    }

    let mode = spec.mode;
    let job = state.build_job(spec)?;
    job.create().await?;
    state.registry.add(job.clone());
    info!(
        job_id = %job.id(),
        process_id = %job.core().spec().process_id,
        host = %job.core().spec().host.kind(),
        mode = %mode,
        "Job submitted"
    );

    {
        let job = job.clone();
        let pipeline = state.pipeline.clone();
        state.runs.spawn(async move {
            job.run().await;
            pipeline.job_finished(job);
        });
    }
    drop(admitted);

    match mode {
        ExecutionMode::Async => Ok(SubmitResponse {
            job_id: job.id(),
            status: job.status(),
            results: None,
        }),
        ExecutionMode::Sync => {
            let status = job.core().wait_terminal().await;
            Ok(SubmitResponse {
                job_id: job.id(),
                status,
                results: job.core().results(),
            })
        }
    }
}

// ============================================================================
// Status Callback
// ============================================================================

/// Body of a status callback.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusUpdateRequest {
    /// Proposed status.
    pub status: String,
    /// Reporter's timestamp.
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
}

/// How a status callback was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Queued for the pipeline.
    Queued,
    /// The job exists but is no longer active; nothing to do.
    NotActive,
}

/// Queue a reported status change.
///
/// Returns [`Error::JobNotFound`] for unknown jobs and
/// [`Error::InvalidRequest`] for unparseable statuses.
pub async fn handle_status_update(
    state: &ProcessHandlerState,
    job_id: Uuid,
    request: StatusUpdateRequest,
) -> Result<CallbackOutcome> {
    let Some(job) = state.registry.get(job_id) else {
        return if state.store.check_exists(job_id).await? {
            debug!(job_id = %job_id, "Status update for inactive job");
            Ok(CallbackOutcome::NotActive)
        } else {
            Err(Error::JobNotFound(job_id))
        };
    };

    let status: JobStatus = request
        .status
        .parse()
        .map_err(|e: crate::job::UnknownStatus| Error::InvalidRequest(e.to_string()))?;

    let queued = state.pipeline.send_status(StatusMessage {
        job,
        status,
        updated: request.updated,
    });
    if !queued {
        warn!(job_id = %job_id, "Status pipeline stopped; update dropped");
        return Ok(CallbackOutcome::NotActive);
    }
    Ok(CallbackOutcome::Queued)
}

// ============================================================================
// Reads
// ============================================================================

/// Current record of a job.
pub async fn handle_get_job(state: &ProcessHandlerState, job_id: Uuid) -> Result<JobRecord> {
    if let Some(job) = state.registry.get(job_id) {
        return Ok(job.core().record());
    }
    state
        .store
        .get_job(job_id)
        .await?
        .ok_or(Error::JobNotFound(job_id))
}

/// Logs of a job.
///
/// Active jobs refresh their workload logs first; a failed refresh still
/// returns what was captured so far.
pub async fn handle_get_logs(state: &ProcessHandlerState, job_id: Uuid) -> Result<JobLogs> {
    if let Some(job) = state.registry.get(job_id) {
        if let Err(e) = job.refresh_logs().await {
            debug!(job_id = %job_id, error = %e, "Serving stale logs");
        }
        return Ok(job.core().logs());
    }

    if let Some(logs) = state.store.get_logs(job_id).await? {
        return Ok(logs);
    }
    let record = state
        .store
        .get_job(job_id)
        .await?
        .ok_or(Error::JobNotFound(job_id))?;
    Ok(JobLogs {
        job_id,
        process_id: record.process_id,
        ..Default::default()
    })
}

/// Results of a successful job.
pub async fn handle_get_results(state: &ProcessHandlerState, job_id: Uuid) -> Result<Value> {
    if let Some(job) = state.registry.get(job_id) {
        let status = job.status();
        if status != JobStatus::Successful {
            return Err(Error::InvalidState { job_id, status });
        }
        return match job.core().results() {
            Some(results) => Ok(results),
            None => extract_results(&job.core().container_logs()),
        };
    }

    let record = state
        .store
        .get_job(job_id)
        .await?
        .ok_or(Error::JobNotFound(job_id))?;
    if record.status != JobStatus::Successful {
        return Err(Error::InvalidState {
            job_id,
            status: record.status,
        });
    }
    let logs = state.store.get_logs(job_id).await?.unwrap_or_default();
    extract_results(&logs.container_logs)
}

/// List job records.
pub async fn handle_list_jobs(
    state: &ProcessHandlerState,
    query: &ListJobsQuery,
) -> Result<Vec<JobRecord>> {
    Ok(state.store.list_jobs(query).await?)
}

// ============================================================================
// Dismissal
// ============================================================================

/// Kill an active job.
pub async fn handle_dismiss(state: &ProcessHandlerState, job_id: Uuid) -> Result<JobRecord> {
    let Some(job) = state.registry.get(job_id) else {
        return match state.store.get_job(job_id).await? {
            Some(record) => Err(Error::InvalidState {
                job_id,
                status: record.status,
            }),
            None => Err(Error::JobNotFound(job_id)),
        };
    };

    job.kill().await?;
    info!(job_id = %job_id, "Job dismissed");
    Ok(job.core().record())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBatchBackend, MockContainerBackend};
    use crate::cache::BoundedJobCache;
    use crate::config::CacheSettings;
    use crate::job::Resources;
    use crate::pipeline::StatusPipeline;
    use crate::storage::LocalObjectStore;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        state: ProcessHandlerState,
        store: Arc<BoundedJobCache>,
    }

    fn fixture(containers: MockContainerBackend) -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(BoundedJobCache::new(CacheSettings {
            snapshot_path: None,
            ..CacheSettings::default()
        }));
        let (pipeline, handle) = StatusPipeline::new(
            registry.clone(),
            store.clone(),
            Arc::new(LocalObjectStore::new(dir.path())),
            "metadata",
            "logs",
        );
        tokio::spawn(pipeline.run());
        let settings = JobSettings {
            batch_poll_interval: Duration::from_millis(1),
            log_fetch_backoff: Duration::from_millis(1),
            ..JobSettings::default()
        };
        let state = ProcessHandlerState::new(
            registry,
            store.clone(),
            handle,
            Arc::new(containers),
            Some(Arc::new(MockBatchBackend::new().with_statuses(["RUNNING"]))),
            settings,
        );
        Fixture {
            _dir: dir,
            state,
            store,
        }
    }

    fn spec(mode: ExecutionMode) -> JobSpec {
        JobSpec {
            process_id: "echo".into(),
            process_version: "1".into(),
            mode,
            submitter: "tester".into(),
            image: "alpine:3".into(),
            command: vec!["echo".into(), "hi".into()],
            env_vars: vec![],
            volumes: vec![],
            resources: Resources::default(),
            host: HostSpec::Local,
        }
    }

    async fn wait_closed(state: &ProcessHandlerState, job_id: Uuid) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while state.registry.get(job_id).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_sync_submit_returns_results() {
        let f = fixture(
            MockContainerBackend::new().with_logs(["{\"plugin_results\": {\"sum\": 3}}"]),
        );
        let response = handle_submit(&f.state, spec(ExecutionMode::Sync))
            .await
            .unwrap();

        assert_eq!(response.status, JobStatus::Successful);
        assert_eq!(response.results, Some(json!({"sum": 3})));

        wait_closed(&f.state, response.job_id).await;
        assert_eq!(
            handle_get_results(&f.state, response.job_id).await.unwrap(),
            json!({"sum": 3})
        );
        let logs = handle_get_logs(&f.state, response.job_id).await.unwrap();
        assert_eq!(logs.container_logs.len(), 1);
    }

    #[tokio::test]
    async fn test_async_submit_returns_immediately() {
        let f = fixture(MockContainerBackend::never_exiting());
        let response = handle_submit(&f.state, spec(ExecutionMode::Async))
            .await
            .unwrap();

        assert_eq!(response.status, JobStatus::Accepted);
        assert!(f.state.registry.get(response.job_id).is_some());
        let record = handle_get_job(&f.state, response.job_id).await.unwrap();
        assert!(!record.status.is_terminal());
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_spec() {
        let f = fixture(MockContainerBackend::new());
        let mut bad = spec(ExecutionMode::Async);
        bad.command.clear();
        assert!(matches!(
            handle_submit(&f.state, bad).await,
            Err(Error::InvalidSpec(_))
        ));
        assert!(f.state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_submit_refused_after_stop_accepting() {
        let f = fixture(MockContainerBackend::new());
        f.state.stop_accepting();
        assert!(matches!(
            handle_submit(&f.state, spec(ExecutionMode::Async)).await,
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_status_callback_outcomes() {
        let f = fixture(MockContainerBackend::never_exiting());
        let job_id = handle_submit(&f.state, spec(ExecutionMode::Async))
            .await
            .unwrap()
            .job_id;

        let bad = StatusUpdateRequest {
            status: "exploded".into(),
            updated: None,
        };
        assert!(matches!(
            handle_status_update(&f.state, job_id, bad).await,
            Err(Error::InvalidRequest(_))
        ));

        let done = StatusUpdateRequest {
            status: "successful".into(),
            updated: Some(Utc::now()),
        };
        assert_eq!(
            handle_status_update(&f.state, job_id, done.clone())
                .await
                .unwrap(),
            CallbackOutcome::Queued
        );
        wait_closed(&f.state, job_id).await;

        assert_eq!(
            handle_status_update(&f.state, job_id, done.clone())
                .await
                .unwrap(),
            CallbackOutcome::NotActive
        );
        assert!(matches!(
            handle_status_update(&f.state, Uuid::new_v4(), done).await,
            Err(Error::JobNotFound(_))
        ));
        let record = f.store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Successful);
    }

    #[tokio::test]
    async fn test_dismiss_active_then_terminal() {
        let f = fixture(MockContainerBackend::never_exiting());
        let job_id = handle_submit(&f.state, spec(ExecutionMode::Async))
            .await
            .unwrap()
            .job_id;

        let record = handle_dismiss(&f.state, job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Dismissed);
        wait_closed(&f.state, job_id).await;

        assert!(matches!(
            handle_dismiss(&f.state, job_id).await,
            Err(Error::InvalidState {
                status: JobStatus::Dismissed,
                ..
            })
        ));
        assert!(matches!(
            handle_dismiss(&f.state, Uuid::new_v4()).await,
            Err(Error::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_batch_submit_without_backend() {
        let mut f = fixture(MockContainerBackend::new());
        f.state.batch_backend = None;
        let mut batch = spec(ExecutionMode::Async);
        batch.host = HostSpec::AwsBatch {
            job_definition: "def".into(),
            job_queue: "queue".into(),
        };
        assert!(matches!(
            handle_submit(&f.state, batch).await,
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_results_of_failed_job() {
        let f = fixture(MockContainerBackend::new().with_exit_code(1));
        let response = handle_submit(&f.state, spec(ExecutionMode::Sync))
            .await
            .unwrap();
        assert_eq!(response.status, JobStatus::Failed);
        wait_closed(&f.state, response.job_id).await;

        assert!(matches!(
            handle_get_results(&f.state, response.job_id).await,
            Err(Error::InvalidState {
                status: JobStatus::Failed,
                ..
            })
        ));
    }
}
