// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Active job registry.
//!
//! The authoritative set of jobs this server is still tracking. A job enters
//! at submission and leaves once its terminal cleanup has completed; after
//! that it is only visible through the record store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::job::Job;
use crate::pipeline::PipelineHandle;
use crate::store::JobRecord;

/// Jobs currently owned by this server.
///
/// The lock is held only for map access, never across backend calls.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Arc<dyn Job>>>,
    drained: Notify,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<dyn Job>>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start tracking a job.
    pub fn add(&self, job: Arc<dyn Job>) {
        let id = job.id();
        self.lock().insert(id, job);
        debug!(job_id = %id, "Job registered");
    }

    /// Stop tracking a job.
    pub fn remove(&self, job_id: Uuid) -> Option<Arc<dyn Job>> {
        let (removed, empty) = {
            let mut jobs = self.lock();
            let removed = jobs.remove(&job_id);
            (removed, jobs.is_empty())
        };
        if removed.is_some() {
            debug!(job_id = %job_id, "Job deregistered");
        }
        if empty {
            self.drained.notify_waiters();
        }
        removed
    }

    /// Look up an active job.
    pub fn get(&self, job_id: Uuid) -> Option<Arc<dyn Job>> {
        self.lock().get(&job_id).cloned()
    }

    /// Number of active jobs.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no job is active.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Records of all active jobs, most recently updated first.
    pub fn list(&self) -> Vec<JobRecord> {
        let jobs: Vec<Arc<dyn Job>> = self.lock().values().cloned().collect();
        let mut records: Vec<JobRecord> = jobs.iter().map(|job| job.core().record()).collect();
        records.sort_by(|a, b| b.updated.cmp(&a.updated));
        records
    }

    /// Kill every non-terminal job without waiting for the kills.
    ///
    /// Each kill runs on its own task and is followed by a job-finished
    /// notification. The task handles are returned so the caller can bound
    /// how long it waits.
    pub fn kill_all(&self, pipeline: &PipelineHandle) -> Vec<JoinHandle<()>> {
        let active: Vec<Arc<dyn Job>> = self
            .lock()
            .values()
            .filter(|job| !job.status().is_terminal())
            .cloned()
            .collect();
        info!(jobs = active.len(), "Killing active jobs");

        active
            .into_iter()
            .map(|job| {
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    if let Err(e) = job.kill().await {
                        warn!(job_id = %job.id(), error = %e, "Failed to kill job");
                    }
                    pipeline.job_finished(job);
                })
            })
            .collect()
    }

    /// Wait until no job is active.
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockContainerBackend;
    use crate::cache::BoundedJobCache;
    use crate::config::CacheSettings;
    use crate::job::{
        ExecutionMode, HostSpec, JobCore, JobSettings, JobSpec, JobStatus, LocalContainerJob,
        Resources,
    };
    use crate::pipeline::StatusPipeline;
    use crate::storage::LocalObjectStore;
    use std::time::Duration;

    fn local_job(store: Arc<BoundedJobCache>, backend: Arc<MockContainerBackend>) -> Arc<dyn Job> {
        let spec = JobSpec {
            process_id: "sleep".into(),
            process_version: "1".into(),
            mode: ExecutionMode::Async,
            submitter: "tester".into(),
            image: "alpine:3".into(),
            command: vec!["sleep".into(), "inf".into()],
            env_vars: vec![],
            volumes: vec![],
            resources: Resources::default(),
            host: HostSpec::Local,
        };
        let core = JobCore::new(Uuid::new_v4(), spec, store);
        Arc::new(LocalContainerJob::new(core, backend, JobSettings::default()))
    }

    #[tokio::test]
    async fn test_add_get_remove() {
        let registry = JobRegistry::new();
        let store = Arc::new(BoundedJobCache::new(CacheSettings::default()));
        let job = local_job(store, Arc::new(MockContainerBackend::new()));
        let id = job.id();

        registry.add(job);
        assert!(registry.get(id).is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].job_id, id);

        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_empty() {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(BoundedJobCache::new(CacheSettings::default()));
        let job = local_job(store, Arc::new(MockContainerBackend::new()));
        let id = job.id();
        registry.add(job);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_until_empty().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        registry.remove(id);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_kill_all_skips_terminal_jobs() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(BoundedJobCache::new(CacheSettings::default()));
        let backend = Arc::new(MockContainerBackend::never_exiting());
        let (pipeline, handle) = StatusPipeline::new(
            registry.clone(),
            store.clone(),
            Arc::new(LocalObjectStore::new(dir.path())),
            "metadata",
            "logs",
        );
        let shutdown = pipeline.shutdown_handle();
        let pipeline_task = tokio::spawn(pipeline.run());

        let active = local_job(store.clone(), backend.clone());
        active.create().await.unwrap();
        let done = local_job(store.clone(), backend.clone());
        done.create().await.unwrap();
        done.core().transition(JobStatus::Failed, None).await;
        registry.add(active.clone());
        registry.add(done.clone());

        for kill in registry.kill_all(&handle) {
            kill.await.unwrap();
        }
        assert_eq!(active.status(), JobStatus::Dismissed);
        assert_eq!(done.status(), JobStatus::Failed);

        tokio::time::timeout(Duration::from_secs(1), async {
            while registry.get(active.id()).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // The terminal job was not killed and stays until its own cleanup.
        assert!(registry.get(done.id()).is_some());

        shutdown.notify_one();
        pipeline_task.await.unwrap();
    }
}
