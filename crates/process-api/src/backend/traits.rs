// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend trait definitions.
//!
//! Backends are PURE execution clients - they never touch the record store
//! or job status. Jobs drive them and own all bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::Resources;

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("Backend unreachable: {0}")]
    Unavailable(String),

    /// A call did not complete in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// Time limit that elapsed.
        after: Duration,
    },

    /// The backend refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The referenced container, job or log stream does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other backend failure.
    #[error("Backend error: {0}")]
    Api(String),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Container to create and start.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (the job id).
    pub name: String,
    /// Image URI.
    pub image: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Resolved environment.
    pub env: HashMap<String, String>,
    /// Volume mounts, `name:/container/path`.
    pub volumes: Vec<String>,
    /// Resource limits.
    pub resources: Resources,
}

/// Lifecycle timestamps reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionTimes {
    /// When the unit of work was created.
    pub created: Option<DateTime<Utc>>,
    /// When it started executing.
    pub started: Option<DateTime<Utc>>,
    /// When it stopped.
    pub ended: Option<DateTime<Utc>>,
}

/// Client over a local container runtime.
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Backend type identifier (e.g., "docker", "mock").
    fn backend_type(&self) -> &'static str;

    /// Check the runtime is reachable.
    async fn ping(&self) -> Result<()>;

    /// Pull `image` unless it is already present.
    async fn ensure_image(&self, image: &str) -> Result<()>;

    /// Create the named volume unless it exists.
    async fn ensure_volume(&self, name: &str) -> Result<()>;

    /// Create and start a container. Returns the container id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Block until the container exits. Returns its exit code.
    async fn wait_container(&self, container_id: &str) -> Result<i64>;

    /// Full stdout/stderr of the container, one entry per line.
    async fn container_logs(&self, container_id: &str) -> Result<Vec<String>>;

    /// Creation, start and finish times of the container.
    async fn container_times(&self, container_id: &str) -> Result<ExecutionTimes>;

    /// Whether the container still exists.
    async fn container_exists(&self, container_id: &str) -> Result<bool>;

    /// Remove a stopped container.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Kill the container if running, then force-remove it.
    async fn kill_and_remove(&self, container_id: &str) -> Result<()>;

    /// Content digest of a local image, if known.
    async fn image_digest(&self, image: &str) -> Result<Option<String>>;
}

/// Job submission to a batch service.
#[derive(Debug, Clone)]
pub struct BatchSubmission {
    /// Remote job name.
    pub name: String,
    /// Job definition name or ARN.
    pub job_definition: String,
    /// Queue name or ARN.
    pub job_queue: String,
    /// Command override.
    pub command: Vec<String>,
    /// Environment override.
    pub env: HashMap<String, String>,
}

/// Snapshot of a remote batch job.
#[derive(Debug, Clone, Default)]
pub struct BatchJobDescription {
    /// Remote status string (`SUBMITTED`, `RUNNING`, ...).
    pub status: String,
    /// Reason attached to the latest status.
    pub status_reason: Option<String>,
    /// Log stream of the current attempt.
    pub log_stream: Option<String>,
    /// Remote lifecycle timestamps.
    pub times: ExecutionTimes,
}

/// Registered batch job definition.
#[derive(Debug, Clone, Default)]
pub struct JobDefinitionInfo {
    /// Image URI the definition runs.
    pub image: String,
    /// vCPU requirement.
    pub vcpus: Option<f64>,
    /// Memory requirement in MiB.
    pub memory_mb: Option<u64>,
}

/// Client over a remote batch service.
#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Backend type identifier (e.g., "aws-batch", "mock").
    fn backend_type(&self) -> &'static str;

    /// Submit a job. Returns the backend job id.
    async fn submit_job(&self, submission: &BatchSubmission) -> Result<String>;

    /// Describe a job.
    async fn describe_job(&self, batch_id: &str) -> Result<BatchJobDescription>;

    /// Cancel a queued job.
    async fn cancel_job(&self, batch_id: &str, reason: &str) -> Result<()>;

    /// Terminate a starting or running job.
    async fn terminate_job(&self, batch_id: &str, reason: &str) -> Result<()>;

    /// Describe a job definition.
    async fn describe_job_definition(&self, job_definition: &str) -> Result<JobDefinitionInfo>;

    /// Fetch every event message of a log stream.
    async fn log_events(&self, log_stream: &str) -> Result<Vec<String>>;
}
