// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs - one execution of a process on a backend.
//!
//! Both variants own a [`JobCore`] and implement [`Job`]:
//!
//! | Variant | Backend | Run model |
//! |---------|---------|-----------|
//! | [`LocalContainerJob`] | [`ContainerBackend`](crate::backend::ContainerBackend) | Blocks on container exit |
//! | [`RemoteBatchJob`] | [`BatchBackend`](crate::backend::BatchBackend) | Polls remote status |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::metadata::JobMetadata;

pub mod batch;
mod core;
pub mod local;
pub mod logs;
mod spec;
mod state;

pub use self::core::{JobCore, LogLevel};
pub use batch::RemoteBatchJob;
pub use local::LocalContainerJob;
pub use logs::JobLogs;
pub use spec::{BackendKind, ExecutionMode, HostSpec, JobSpec, Resources};
pub use state::{JobStatus, Transition, UnknownStatus};

/// Tunables shared by all jobs of one runtime.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Name of this server, used to label remote jobs.
    pub server_name: String,
    /// Deadline for backend calls other than the container wait.
    pub backend_timeout: Duration,
    /// Remote status poll interval.
    pub batch_poll_interval: Duration,
    /// Remote log fetch attempts on close.
    pub log_fetch_attempts: u32,
    /// Base backoff between remote log fetch attempts.
    pub log_fetch_backoff: Duration,
    /// Pull the image when a local job is created.
    pub pull_image_on_create: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            server_name: "process-api".to_string(),
            backend_timeout: Duration::from_secs(30),
            batch_poll_interval: Duration::from_secs(10),
            log_fetch_attempts: 5,
            log_fetch_backoff: Duration::from_secs(10),
            pull_image_on_create: false,
        }
    }
}

/// Operations every job variant supports.
#[async_trait]
pub trait Job: Send + Sync {
    /// Shared bookkeeping.
    fn core(&self) -> &JobCore;

    /// Validate, reach the backend and persist the `accepted` record.
    async fn create(&self) -> Result<()>;

    /// Drive the job until it is terminal or cancelled.
    async fn run(&self);

    /// Stop the job and move it to `dismissed`.
    async fn kill(&self) -> Result<()>;

    /// Pull the latest workload logs from the backend.
    async fn refresh_logs(&self) -> Result<()>;

    /// Release backend resources and capture final logs.
    async fn close(&self);

    /// Provenance document for a successful job.
    async fn metadata(&self) -> Result<JobMetadata>;

    /// Job identifier.
    fn id(&self) -> Uuid {
        self.core().id()
    }

    /// Current status.
    fn status(&self) -> JobStatus {
        self.core().status()
    }

    /// Time of the last status change.
    fn last_update(&self) -> DateTime<Utc> {
        self.core().last_update()
    }
}
