// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job record store.
//!
//! Durable history of job identity, status and timestamps, plus the final
//! logs of closed jobs. Implementations:
//!
//! | Store | Module | Notes |
//! |-------|--------|-------|
//! | SQLite | [`sqlite`] | Embedded, single file |
//! | PostgreSQL | [`postgres`] | Shared server |
//! | Bounded cache | [`crate::cache`] | In-memory, evicts old terminal jobs |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::job::{BackendKind, ExecutionMode, JobLogs, JobStatus};

pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresJobStore;
pub use sqlite::SqliteJobStore;

/// Default page size for listings.
pub const DEFAULT_LIST_LIMIT: i64 = 20;
/// Largest page size a listing may request.
pub const MAX_LIST_LIMIT: i64 = 100;

/// Errors from record store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// No record exists for the job.
    #[error("Job record not found: {0}")]
    NotFound(Uuid),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    /// Job identifier.
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    /// Current status.
    pub status: JobStatus,
    /// Time of the last status change.
    pub updated: DateTime<Utc>,
    /// Process the job executes.
    #[serde(rename = "processID")]
    pub process_id: String,
    /// Sync or async execution.
    pub mode: ExecutionMode,
    /// Backend kind.
    pub host: BackendKind,
    /// Submitter identity.
    pub submitter: String,
}

impl JobRecord {
    /// Approximate in-memory footprint in bytes.
    pub fn approx_size(&self) -> u64 {
        (16 + 12
            + self.status.as_str().len()
            + self.mode.as_str().len()
            + self.host.as_str().len()
            + self.process_id.len()
            + self.submitter.len()) as u64
    }

    pub(crate) fn from_columns(
        id: &str,
        status: &str,
        updated: DateTime<Utc>,
        mode: &str,
        host: &str,
        process_id: String,
        submitter: String,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            job_id: Uuid::parse_str(id)
                .map_err(|e| StoreError::Corrupt(format!("job id '{id}': {e}")))?,
            status: status
                .parse()
                .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
            updated,
            mode: mode.parse().map_err(StoreError::Corrupt)?,
            host: host.parse().map_err(StoreError::Corrupt)?,
            process_id,
            submitter,
        })
    }
}

/// Filters and pagination for [`JobRecordStore::list_jobs`].
///
/// Empty filter lists match everything. Values within one list are OR'd,
/// lists are AND'd together.
#[derive(Debug, Clone, Default)]
pub struct ListJobsQuery {
    /// Requested page size, clamped to `[1, 100]`.
    pub limit: Option<i64>,
    /// Requested offset, clamped to `>= 0`.
    pub offset: Option<i64>,
    /// Process identifiers to match.
    pub process_ids: Vec<String>,
    /// Statuses to match.
    pub statuses: Vec<JobStatus>,
    /// Submitters to match.
    pub submitters: Vec<String>,
}

impl ListJobsQuery {
    /// Effective page size.
    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }

    /// Effective offset.
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// Whether a record passes the filters.
    pub fn matches(&self, record: &JobRecord) -> bool {
        (self.process_ids.is_empty() || self.process_ids.contains(&record.process_id))
            && (self.statuses.is_empty() || self.statuses.contains(&record.status))
            && (self.submitters.is_empty() || self.submitters.contains(&record.submitter))
    }
}

/// Persistence contract for job history.
#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Store type identifier (e.g., "sqlite", "postgres", "cache").
    fn store_type(&self) -> &'static str;

    /// Insert the initial record of a job.
    async fn add_job(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Record a status change.
    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        updated: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Fetch one record.
    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    /// Whether a record exists.
    async fn check_exists(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.get_job(job_id).await?.is_some())
    }

    /// List records, most recently updated first.
    async fn list_jobs(&self, query: &ListJobsQuery) -> Result<Vec<JobRecord>, StoreError>;

    /// Insert or replace the final logs of a job.
    async fn upsert_logs(&self, logs: &JobLogs) -> Result<(), StoreError>;

    /// Fetch the stored logs of a job.
    async fn get_logs(&self, job_id: Uuid) -> Result<Option<JobLogs>, StoreError>;

    /// Release resources held by the store.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(process: &str, status: JobStatus, submitter: &str) -> JobRecord {
        JobRecord {
            job_id: Uuid::new_v4(),
            status,
            updated: Utc::now(),
            process_id: process.into(),
            mode: ExecutionMode::Async,
            host: BackendKind::Local,
            submitter: submitter.into(),
        }
    }

    #[test]
    fn test_limit_and_offset_clamping() {
        let q = ListJobsQuery::default();
        assert_eq!(q.limit(), 20);
        assert_eq!(q.offset(), 0);

        let q = ListJobsQuery {
            limit: Some(500),
            offset: Some(-3),
            ..Default::default()
        };
        assert_eq!(q.limit(), 100);
        assert_eq!(q.offset(), 0);

        let q = ListJobsQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.limit(), 1);
    }

    #[test]
    fn test_filters_or_within_and_across() {
        let q = ListJobsQuery {
            process_ids: vec!["a".into(), "b".into()],
            statuses: vec![JobStatus::Failed],
            ..Default::default()
        };
        assert!(q.matches(&record("a", JobStatus::Failed, "x")));
        assert!(q.matches(&record("b", JobStatus::Failed, "y")));
        assert!(!q.matches(&record("c", JobStatus::Failed, "x")));
        assert!(!q.matches(&record("a", JobStatus::Running, "x")));
        assert!(ListJobsQuery::default().matches(&record("z", JobStatus::Accepted, "")));
    }

    #[test]
    fn test_from_columns_rejects_garbage() {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        assert!(
            JobRecord::from_columns(&id, "running", now, "async-execute", "local", "p".into(), "s".into())
                .is_ok()
        );
        assert!(matches!(
            JobRecord::from_columns(&id, "paused", now, "async-execute", "local", "p".into(), "s".into()),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            JobRecord::from_columns("nope", "running", now, "async-execute", "local", "p".into(), "s".into()),
            Err(StoreError::Corrupt(_))
        ));
    }
}
