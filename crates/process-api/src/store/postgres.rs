// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed job record store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use super::{JobRecord, JobRecordStore, ListJobsQuery, StoreError};
use crate::job::{JobLogs, JobStatus};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/postgres");

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
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
            &row.id.to_string(),
            &row.status,
            row.updated,
            &row.mode,
            &row.host,
            row.process_id,
            row.submitter,
        )
    }
}

/// PostgreSQL-backed job record store.
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Wrap an existing pool. Migrations must already be applied.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
        MIGRATOR.run(&pool).await?;
        debug!("PostgreSQL job store ready");
        Ok(Self { pool })
    }

    /// Apply the embedded migrations to `pool`.
    pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
        MIGRATOR.run(pool).await?;
        Ok(())
    }
}

fn push_any_of(qb: &mut QueryBuilder<'_, Postgres>, column: &str, values: Vec<String>) {
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} = ANY("))
        .push_bind(values)
        .push(")");
}

#[async_trait]
impl JobRecordStore for PostgresJobStore {
    fn store_type(&self) -> &'static str {
        "postgres"
    }

    async fn add_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, status, updated, mode, host, process_id, submitter)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.job_id)
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
        let result = sqlx::query("UPDATE jobs SET status = $1, updated = $2 WHERE id = $3")
            .bind(status.as_str())
            .bind(updated)
            .bind(job_id)
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
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn check_exists(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM jobs WHERE id = $1)")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn list_jobs(&self, query: &ListJobsQuery) -> Result<Vec<JobRecord>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT id, status, updated, mode, host, process_id, submitter FROM jobs WHERE TRUE",
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
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id) DO UPDATE SET
                process_id = EXCLUDED.process_id,
                container_logs = EXCLUDED.container_logs,
                api_logs = EXCLUDED.api_logs
            "#,
        )
        .bind(logs.job_id)
        .bind(&logs.process_id)
        .bind(Json(&logs.container_logs))
        .bind(Json(&logs.api_logs))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_logs(&self, job_id: Uuid) -> Result<Option<JobLogs>, StoreError> {
        let row: Option<(String, Json<Vec<String>>, Json<Vec<String>>)> = sqlx::query_as(
            "SELECT process_id, container_logs, api_logs FROM job_logs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(process_id, container_logs, api_logs)| JobLogs {
            job_id,
            process_id,
            container_logs: container_logs.0,
            api_logs: api_logs.0,
        }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
