// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for process-api integration tests.
//!
//! Provides TestContext for running a full runtime against mock backends.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use process_api::backend::{MockBatchBackend, MockContainerBackend};
use process_api::cache::BoundedJobCache;
use process_api::config::CacheSettings;
use process_api::job::{ExecutionMode, HostSpec, JobLogs, JobSettings, JobSpec, JobStatus, Resources};
use process_api::runtime::ProcessRuntime;
use process_api::storage::{self, LocalObjectStore, ObjectStore};
use process_api::store::{JobRecord, JobRecordStore, ListJobsQuery, StoreError};

/// Runtime wired to mock backends and a temp object store.
pub struct TestContext {
    pub runtime: ProcessRuntime,
    pub store: Arc<RecordingStore>,
    pub objects: Arc<CountingObjectStore>,
    pub containers: Arc<MockContainerBackend>,
    pub batch: Arc<MockBatchBackend>,
    _storage_dir: tempfile::TempDir,
}

impl TestContext {
    /// Default mocks, cache-backed store.
    pub async fn new() -> Self {
        Self::with_backends(MockContainerBackend::new(), MockBatchBackend::new()).await
    }

    /// Cache-backed store with the given mocks.
    pub async fn with_backends(containers: MockContainerBackend, batch: MockBatchBackend) -> Self {
        Self::build(containers, batch, Arc::new(test_cache()), None).await
    }

    /// Build a context around an arbitrary record store.
    pub async fn build(
        containers: MockContainerBackend,
        batch: MockBatchBackend,
        inner: Arc<dyn JobRecordStore>,
        grace: Option<Duration>,
    ) -> Self {
        Self::assemble(containers, batch, inner, grace, None).await
    }

    /// Cache-backed context that also serves HTTP on an ephemeral port.
    pub async fn serving(
        containers: MockContainerBackend,
        batch: MockBatchBackend,
        grace: Duration,
    ) -> Self {
        let addr: SocketAddr = "127.0.0.1:0".parse().expect("valid address");
        Self::assemble(
            containers,
            batch,
            Arc::new(test_cache()),
            Some(grace),
            Some(addr),
        )
        .await
    }

    async fn assemble(
        containers: MockContainerBackend,
        batch: MockBatchBackend,
        inner: Arc<dyn JobRecordStore>,
        grace: Option<Duration>,
        bind: Option<SocketAddr>,
    ) -> Self {
        let storage_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(RecordingStore::new(inner));
        let objects = Arc::new(CountingObjectStore::new(LocalObjectStore::new(
            storage_dir.path(),
        )));
        let containers = Arc::new(containers);
        let batch = Arc::new(batch);

        let mut builder = ProcessRuntime::builder()
            .store(store.clone())
            .container_backend(containers.clone())
            .batch_backend(batch.clone())
            .object_store(objects.clone())
            .settings(fast_settings())
            .shutdown_grace(grace.unwrap_or(Duration::from_secs(5)));
        if let Some(addr) = bind {
            builder = builder.bind_addr(addr);
        }
        let runtime = builder
            .build()
            .expect("Failed to build runtime")
            .start()
            .await
            .expect("Failed to start runtime");

        Self {
            runtime,
            store,
            objects,
            containers,
            batch,
            _storage_dir: storage_dir,
        }
    }

    /// Wait until the job reports `status`.
    pub async fn wait_status(&self, job_id: Uuid, status: JobStatus) {
        let runtime = &self.runtime;
        wait_for(Duration::from_secs(5), || async move {
            runtime.status(job_id).await.map(|r| r.status).ok() == Some(status)
        })
        .await;
    }

    /// Wait until the job has left the registry (its close has completed).
    pub async fn wait_closed(&self, job_id: Uuid) {
        let registry = self.runtime.registry().clone();
        wait_for(Duration::from_secs(5), || {
            let registry = registry.clone();
            async move { registry.get(job_id).is_none() }
        })
        .await;
    }
}

/// Job settings with millisecond poll and backoff intervals.
pub fn fast_settings() -> JobSettings {
    JobSettings {
        server_name: "test-server".to_string(),
        backend_timeout: Duration::from_secs(2),
        batch_poll_interval: Duration::from_millis(2),
        log_fetch_attempts: 3,
        log_fetch_backoff: Duration::from_millis(2),
        pull_image_on_create: false,
    }
}

/// Cache without a snapshot file.
pub fn test_cache() -> BoundedJobCache {
    BoundedJobCache::new(CacheSettings {
        snapshot_path: None,
        ..CacheSettings::default()
    })
}

/// Spec for a local job.
pub fn local_spec(mode: ExecutionMode) -> JobSpec {
    JobSpec {
        process_id: "echo".to_string(),
        process_version: "1.0".to_string(),
        mode,
        submitter: "tester@example.com".to_string(),
        image: "alpine:3".to_string(),
        command: vec!["echo".to_string(), "hello".to_string()],
        env_vars: vec![],
        volumes: vec![],
        resources: Resources::default(),
        host: HostSpec::Local,
    }
}

/// Spec for a batch job.
pub fn batch_spec(mode: ExecutionMode) -> JobSpec {
    JobSpec {
        process_id: "hms-run".to_string(),
        host: HostSpec::AwsBatch {
            job_definition: "hms-run:3".to_string(),
            job_queue: "process-queue".to_string(),
        },
        ..local_spec(mode)
    }
}

/// Poll `condition` until it holds, panicking after `limit`.
pub async fn wait_for<F, Fut>(limit: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(limit, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

/// Record store wrapper that remembers every status write per job.
pub struct RecordingStore {
    inner: Arc<dyn JobRecordStore>,
    history: Mutex<HashMap<Uuid, Vec<JobStatus>>>,
    closed: Mutex<bool>,
}

impl RecordingStore {
    pub fn new(inner: Arc<dyn JobRecordStore>) -> Self {
        Self {
            inner,
            history: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
        }
    }

    /// Statuses written for a job, initial record included.
    pub fn history(&self, job_id: Uuid) -> Vec<JobStatus> {
        self.history
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

#[async_trait]
impl JobRecordStore for RecordingStore {
    fn store_type(&self) -> &'static str {
        "recording"
    }

    async fn add_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.history
            .lock()
            .unwrap()
            .entry(record.job_id)
            .or_default()
            .push(record.status);
        self.inner.add_job(record).await
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        updated: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.history
            .lock()
            .unwrap()
            .entry(job_id)
            .or_default()
            .push(status);
        self.inner.update_status(job_id, status, updated).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(&self, query: &ListJobsQuery) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list_jobs(query).await
    }

    async fn upsert_logs(&self, logs: &JobLogs) -> Result<(), StoreError> {
        self.inner.upsert_logs(logs).await
    }

    async fn get_logs(&self, job_id: Uuid) -> Result<Option<JobLogs>, StoreError> {
        self.inner.get_logs(job_id).await
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
        self.inner.close().await;
    }
}

/// Object store wrapper that counts writes per key.
pub struct CountingObjectStore {
    inner: LocalObjectStore,
    puts: Mutex<HashMap<String, u32>>,
}

impl CountingObjectStore {
    pub fn new(inner: LocalObjectStore) -> Self {
        Self {
            inner,
            puts: Mutex::new(HashMap::new()),
        }
    }

    /// Number of writes to `key`.
    pub fn put_count(&self, key: &str) -> u32 {
        self.puts.lock().unwrap().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ObjectStore for CountingObjectStore {
    fn store_type(&self) -> &'static str {
        "counting"
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        expires_in: Option<Duration>,
    ) -> storage::Result<()> {
        *self.puts.lock().unwrap().entry(key.to_string()).or_default() += 1;
        self.inner.put(key, bytes, content_type, expires_in).await
    }

    async fn exists(&self, key: &str) -> storage::Result<bool> {
        self.inner.exists(key).await
    }

    async fn get(&self, key: &str) -> storage::Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }
}
