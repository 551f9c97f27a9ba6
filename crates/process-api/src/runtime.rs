// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for process-api.
//!
//! [`ProcessRuntime`] wires the registry, status pipeline, record store and
//! backends together and owns the background tasks. It can serve HTTP or be
//! driven directly through its methods.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use process_api::backend::DockerBackend;
//! use process_api::runtime::ProcessRuntime;
//! use process_api::storage::LocalObjectStore;
//! use process_api::store::SqliteJobStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(SqliteJobStore::connect("sqlite:.data/jobs.db").await?);
//!
//!     let runtime = ProcessRuntime::builder()
//!         .store(store)
//!         .container_backend(Arc::new(DockerBackend::connect_local()?))
//!         .object_store(Arc::new(LocalObjectStore::new(".data/storage")))
//!         .bind_addr("0.0.0.0:5050".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run until a signal arrives ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{BatchBackend, ContainerBackend};
use crate::cache::{BoundedJobCache, CacheMonitor};
use crate::config::Config;
use crate::handlers::{
    CallbackOutcome, ProcessHandlerState, StatusUpdateRequest, SubmitResponse, handle_dismiss,
    handle_get_job, handle_get_logs, handle_get_results, handle_list_jobs, handle_status_update,
    handle_submit,
};
use crate::job::{JobLogs, JobSettings, JobSpec};
use crate::pipeline::StatusPipeline;
use crate::registry::JobRegistry;
use crate::server::run_http_server;
use crate::storage::ObjectStore;
use crate::store::{JobRecord, JobRecordStore, ListJobsQuery};

/// Builder for creating a [`ProcessRuntime`].
pub struct ProcessRuntimeBuilder {
    store: Option<Arc<dyn JobRecordStore>>,
    cache: Option<Arc<BoundedJobCache>>,
    container_backend: Option<Arc<dyn ContainerBackend>>,
    batch_backend: Option<Arc<dyn BatchBackend>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    bind_addr: Option<SocketAddr>,
    settings: JobSettings,
    metadata_prefix: String,
    logs_prefix: String,
    shutdown_grace: Duration,
}

impl Default for ProcessRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            cache: None,
            container_backend: None,
            batch_backend: None,
            object_store: None,
            bind_addr: None,
            settings: JobSettings::default(),
            metadata_prefix: "metadata".to_string(),
            logs_prefix: "logs".to_string(),
            shutdown_grace: Duration::from_secs(8),
        }
    }
}

impl ProcessRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply listen address, job tunables, key prefixes and grace period from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self::new()
            .bind_addr(config.http_addr)
            .settings(JobSettings {
                server_name: config.server_name.clone(),
                backend_timeout: config.backend_timeout,
                batch_poll_interval: config.batch_poll_interval,
                log_fetch_attempts: config.log_fetch_attempts,
                log_fetch_backoff: config.log_fetch_backoff,
                pull_image_on_create: config.pull_image_on_create,
            })
            .metadata_prefix(config.metadata_prefix.clone())
            .logs_prefix(config.logs_prefix.clone())
            .shutdown_grace(config.shutdown_grace)
    }

    /// Set a durable record store. Either this or [`cache`](Self::cache) is required.
    pub fn store(mut self, store: Arc<dyn JobRecordStore>) -> Self {
        self.store = Some(store);
        self.cache = None;
        self
    }

    /// Use the bounded in-memory cache as the record store.
    ///
    /// A [`CacheMonitor`] is started alongside the runtime.
    pub fn cache(mut self, cache: Arc<BoundedJobCache>) -> Self {
        self.store = Some(cache.clone());
        self.cache = Some(cache);
        self
    }

    /// Set the local container runtime (required).
    pub fn container_backend(mut self, backend: Arc<dyn ContainerBackend>) -> Self {
        self.container_backend = Some(backend);
        self
    }

    /// Set the batch service. Without one, batch submissions are refused.
    pub fn batch_backend(mut self, backend: Arc<dyn BatchBackend>) -> Self {
        self.batch_backend = Some(backend);
        self
    }

    /// Set the object store for metadata and log bundles (required).
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Serve HTTP on this address.
    ///
    /// Default: `None` (no HTTP server)
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Set per-job tunables.
    pub fn settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Key prefix for metadata documents.
    ///
    /// Default: `metadata`
    pub fn metadata_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metadata_prefix = prefix.into();
        self
    }

    /// Key prefix for log bundles.
    ///
    /// Default: `logs`
    pub fn logs_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.logs_prefix = prefix.into();
        self
    }

    /// How long shutdown waits for active jobs to be killed and closed.
    ///
    /// Default: 8 seconds
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ProcessRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let container_backend = self
            .container_backend
            .ok_or_else(|| anyhow::anyhow!("container_backend is required"))?;
        let object_store = self
            .object_store
            .ok_or_else(|| anyhow::anyhow!("object_store is required"))?;

        Ok(ProcessRuntimeConfig {
            store,
            cache: self.cache,
            container_backend,
            batch_backend: self.batch_backend,
            object_store,
            bind_addr: self.bind_addr,
            settings: self.settings,
            metadata_prefix: self.metadata_prefix,
            logs_prefix: self.logs_prefix,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

/// Configuration for a [`ProcessRuntime`].
pub struct ProcessRuntimeConfig {
    store: Arc<dyn JobRecordStore>,
    cache: Option<Arc<BoundedJobCache>>,
    container_backend: Arc<dyn ContainerBackend>,
    batch_backend: Option<Arc<dyn BatchBackend>>,
    object_store: Arc<dyn ObjectStore>,
    bind_addr: Option<SocketAddr>,
    settings: JobSettings,
    metadata_prefix: String,
    logs_prefix: String,
    shutdown_grace: Duration,
}

impl ProcessRuntimeConfig {
    /// Start the runtime, spawning the pipeline, cache monitor and HTTP server.
    pub async fn start(self) -> Result<ProcessRuntime> {
        let registry = Arc::new(JobRegistry::new());

        let (pipeline, pipeline_sender) = StatusPipeline::new(
            registry.clone(),
            self.store.clone(),
            self.object_store.clone(),
            self.metadata_prefix,
            self.logs_prefix,
        );
        let pipeline_shutdown = pipeline.shutdown_handle();
        let pipeline_tasks = pipeline.tasks();
        let pipeline_handle = tokio::spawn(pipeline.run());

        let monitor = self.cache.map(|cache| {
            warn!(
                max_size_bytes = cache.settings().max_size_bytes,
                "No database configured; job history lives in a bounded in-memory cache \
                 and evicted jobs are lost permanently"
            );
            let monitor = CacheMonitor::new(cache);
            let shutdown = monitor.shutdown_handle();
            let handle = tokio::spawn(async move {
                monitor.run().await;
            });
            (handle, shutdown)
        });

        let state = Arc::new(ProcessHandlerState::new(
            registry,
            self.store.clone(),
            pipeline_sender,
            self.container_backend,
            self.batch_backend,
            self.settings,
        ));

        let server = match self.bind_addr {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                let local_addr = listener.local_addr()?;
                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let handle = tokio::spawn(run_http_server(listener, state.clone(), shutdown_rx));
                Some(ServerTask {
                    handle,
                    shutdown_tx,
                    local_addr,
                })
            }
            None => None,
        };

        info!(
            store = self.store.store_type(),
            object_store = self.object_store.store_type(),
            batch_enabled = state.batch_backend.is_some(),
            http_addr = ?server.as_ref().map(|s| s.local_addr),
            "ProcessRuntime started"
        );

        Ok(ProcessRuntime {
            state,
            store: self.store,
            pipeline_handle,
            pipeline_shutdown,
            pipeline_tasks,
            monitor,
            server,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

struct ServerTask {
    handle: JoinHandle<Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// A running process-api instance.
///
/// The runtime manages:
/// - Status pipeline for transitions and terminal cleanup
/// - Cache monitor (cache mode only)
/// - HTTP server (when a bind address is configured)
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ProcessRuntime {
    state: Arc<ProcessHandlerState>,
    store: Arc<dyn JobRecordStore>,
    pipeline_handle: JoinHandle<()>,
    pipeline_shutdown: Arc<Notify>,
    pipeline_tasks: TaskTracker,
    monitor: Option<(JoinHandle<()>, Arc<Notify>)>,
    server: Option<ServerTask>,
    shutdown_grace: Duration,
}

impl ProcessRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ProcessRuntimeBuilder {
        ProcessRuntimeBuilder::new()
    }

    /// Address the HTTP server is bound to, if serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<ProcessHandlerState> {
        &self.state
    }

    /// Active job registry.
    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.state.registry
    }

    /// Submit a job. Synchronous jobs return once terminal.
    pub async fn submit(&self, spec: JobSpec) -> crate::Result<SubmitResponse> {
        handle_submit(&self.state, spec).await
    }

    /// Current record of a job.
    pub async fn status(&self, job_id: Uuid) -> crate::Result<JobRecord> {
        handle_get_job(&self.state, job_id).await
    }

    /// Logs of a job.
    pub async fn logs(&self, job_id: Uuid) -> crate::Result<JobLogs> {
        handle_get_logs(&self.state, job_id).await
    }

    /// Results of a successful job.
    pub async fn results(&self, job_id: Uuid) -> crate::Result<Value> {
        handle_get_results(&self.state, job_id).await
    }

    /// Kill an active job.
    pub async fn dismiss(&self, job_id: Uuid) -> crate::Result<JobRecord> {
        handle_dismiss(&self.state, job_id).await
    }

    /// List job records.
    pub async fn list_jobs(&self, query: &ListJobsQuery) -> crate::Result<Vec<JobRecord>> {
        handle_list_jobs(&self.state, query).await
    }

    /// Queue an externally reported status change.
    pub async fn status_callback(
        &self,
        job_id: Uuid,
        request: StatusUpdateRequest,
    ) -> crate::Result<CallbackOutcome> {
        handle_status_update(&self.state, job_id, request).await
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting work, kills every active job and waits up to the
    /// grace period for them to be closed. Then stops the pipeline and cache
    /// monitor, closes the record store and waits for the HTTP server. Every
    /// wait shares the one grace deadline.
    pub async fn shutdown(self) -> Result<()> {
        info!(
            active_jobs = self.state.registry.len(),
            "ProcessRuntime shutting down..."
        );

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        self.state.stop_accepting();
        if let Some(server) = &self.server {
            let _ = server.shutdown_tx.send(true);
        }
        if tokio::time::timeout_at(deadline, self.state.drain_admissions())
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed with submissions still being admitted");
        }

        let kills = self.state.registry.kill_all(&self.state.pipeline);
        let runs = self.state.runs();
        runs.close();

        let registry = self.state.registry.clone();
        let drained = async {
            for kill in kills {
                if let Err(e) = kill.await {
                    error!("Kill task panicked: {}", e);
                }
            }
            registry.wait_until_empty().await;
            runs.wait().await;
        };
        if tokio::time::timeout_at(deadline, drained).await.is_err() {
            warn!(
                remaining = registry.len(),
                "Shutdown grace period elapsed with jobs still active"
            );
        }

        // Signal pipeline shutdown
        self.pipeline_shutdown.notify_one();
        if let Err(e) = self.pipeline_handle.await {
            error!("Status pipeline task panicked: {}", e);
        }
        if tokio::time::timeout_at(deadline, self.pipeline_tasks.wait())
            .await
            .is_err()
        {
            warn!(
                pending = self.pipeline_tasks.len(),
                "Shutdown grace period elapsed with cleanups pending"
            );
        }

        // Signal cache monitor shutdown
        if let Some((handle, shutdown)) = self.monitor {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Cache monitor task panicked: {}", e);
            }
        }

        self.store.close().await;

        // Wait for server
        let Some(server) = self.server else {
            info!("ProcessRuntime shutdown complete");
            return Ok(());
        };
        let mut handle = server.handle;
        match tokio::time::timeout_at(deadline, &mut handle).await {
            Ok(Ok(Ok(()))) => {
                info!("ProcessRuntime shutdown complete");
                Ok(())
            }
            Ok(Ok(Err(e))) => {
                error!("ProcessRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Ok(Err(e)) => {
                error!("ProcessRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
            Err(_) => {
                warn!("HTTP server still draining after the grace period; aborting it");
                handle.abort();
                info!("ProcessRuntime shutdown complete");
                Ok(())
            }
        }
    }

    /// Check if the runtime's background tasks are still running.
    pub fn is_running(&self) -> bool {
        let server_running = self
            .server
            .as_ref()
            .is_none_or(|s| !s.handle.is_finished());
        let monitor_running = self
            .monitor
            .as_ref()
            .is_none_or(|(handle, _)| !handle.is_finished());

        !self.pipeline_handle.is_finished() && server_running && monitor_running
    }
}
