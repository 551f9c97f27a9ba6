// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed job record store.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::{JobRecord, JobRecordStore, ListJobsQuery, StoreError};
use crate::job::{JobLogs, JobStatus};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    status: String,
    updated: DateTime<Utc>,
    mode: String,
    host: String,
    process_id: String,
    submitter: String,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        JobRecord::from_columns(
            &row.id,
            &row.status,
            row.updated,
            &row.mode,
            &row.host,
            row.process_id,
            row.submitter,
        )
    }
}

/// SQLite-backed job record store.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `path` and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        Self::connect(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// Connect using a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        // Single writer keeps the embedded database free of lock contention.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;

        MIGRATOR.run(&pool).await?;
        debug!(url = %url, "SQLite job store ready");

        Ok(Self { pool })
    }

    /// Apply the embedded migrations to `pool`.
    pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
        MIGRATOR.run(pool).await?;
        Ok(())
    }
}

fn push_any_of(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, values: Vec<String>) {
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    let mut list = qb.separated(", ");
    for value in values {
        list.push_bind(value);
    }
    list.push_unseparated(")");
}

#[async_trait]
impl JobRecordStore for SqliteJobStore {
    fn store_type(&self) -> &'static str {
        "sqlite"
    }

    async fn add_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, updated, mode, host, process_id, submitter)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.job_id.to_string())
        .bind(record.status.as_str())
        .bind(record.updated)
        .bind(record.mode.as_str())
        .bind(record.host.as_str())
        .bind(&record.process_id)
        .bind(&record.submitter)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        updated: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE jobs SET status = ?, updated = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(updated)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, status, updated, mode, host, process_id, submitter
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn check_exists(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM jobs WHERE id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn list_jobs(&self, query: &ListJobsQuery) -> Result<Vec<JobRecord>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, status, updated, mode, host, process_id, submitter FROM jobs WHERE 1 = 1",
        );
        push_any_of(&mut qb, "process_id", query.process_ids.clone());
        push_any_of(
            &mut qb,
            "status",
            query.statuses.iter().map(|s| s.as_str().to_string()).collect(),
        );
        push_any_of(&mut qb, "submitter", query.submitters.clone());
        qb.push(" ORDER BY updated DESC, id DESC LIMIT ")
            .push_bind(query.limit())
            .push(" OFFSET ")
            .push_bind(query.offset());

        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn upsert_logs(&self, logs: &JobLogs) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, process_id, container_logs, api_logs)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (job_id) DO UPDATE SET
                process_id = excluded.process_id,
                container_logs = excluded.container_logs,
                api_logs = excluded.api_logs
            "#,
        )
        .bind(logs.job_id.to_string())
        .bind(&logs.process_id)
        .bind(serde_json::to_string(&logs.container_logs)?)
        .bind(serde_json::to_string(&logs.api_logs)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_logs(&self, job_id: Uuid) -> Result<Option<JobLogs>, StoreError> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT process_id, container_logs, api_logs FROM job_logs WHERE job_id = ?",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some((process_id, container_logs, api_logs)) = row else {
            return Ok(None);
        };
        Ok(Some(JobLogs {
            job_id,
            process_id,
            container_logs: serde_json::from_str(&container_logs)?,
            api_logs: serde_json::from_str(&api_logs)?,
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
