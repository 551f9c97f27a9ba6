// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Record store contract tests shared by every backend.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use common::{TestContext, local_spec, test_cache};
use process_api::backend::{MockBatchBackend, MockContainerBackend};
use process_api::job::{BackendKind, ExecutionMode, JobLogs, JobStatus};
use process_api::store::{
    JobRecord, JobRecordStore, ListJobsQuery, PostgresJobStore, SqliteJobStore, StoreError,
};

/// Helper macro to skip tests if database URL is not set.
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_PROCESS_API_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_PROCESS_API_DATABASE_URL not set");
            return;
        }
    };
}

fn record(process: &str, submitter: &str, minutes_ago: i64) -> JobRecord {
    JobRecord {
        job_id: Uuid::new_v4(),
        status: JobStatus::Accepted,
        updated: Utc::now() - Duration::minutes(minutes_ago),
        process_id: process.to_string(),
        mode: ExecutionMode::Async,
        host: BackendKind::Local,
        submitter: submitter.to_string(),
    }
}

/// Exercise the full store contract with a unique process id namespace.
async fn exercise_store(store: &dyn JobRecordStore) {
    let ns = Uuid::new_v4().simple().to_string();
    let alpha = format!("alpha-{ns}");
    let beta = format!("beta-{ns}");

    let oldest = record(&alpha, "ann", 30);
    let middle = record(&beta, "bob", 20);
    let newest = record(&alpha, "bob", 10);
    for r in [&oldest, &middle, &newest] {
        store.add_job(r).await.unwrap();
    }

    let fetched = store.get_job(oldest.job_id).await.unwrap().unwrap();
    assert_eq!(fetched.job_id, oldest.job_id);
    assert_eq!(fetched.status, JobStatus::Accepted);
    assert_eq!(fetched.process_id, alpha);
    assert_eq!(fetched.submitter, "ann");
    assert_eq!(
        fetched.updated.timestamp_millis(),
        oldest.updated.timestamp_millis()
    );
    assert!(store.check_exists(middle.job_id).await.unwrap());
    assert!(!store.check_exists(Uuid::new_v4()).await.unwrap());
    assert!(store.get_job(Uuid::new_v4()).await.unwrap().is_none());

    let later = Utc::now();
    store
        .update_status(middle.job_id, JobStatus::Running, later)
        .await
        .unwrap();
    let updated = store.get_job(middle.job_id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Running);
    assert_eq!(updated.updated.timestamp_millis(), later.timestamp_millis());

    assert!(matches!(
        store
            .update_status(Uuid::new_v4(), JobStatus::Failed, later)
            .await,
        Err(StoreError::NotFound(_))
    ));

    // Newest first, filters OR within a list and AND across lists.
    let both = ListJobsQuery {
        process_ids: vec![alpha.clone(), beta.clone()],
        ..Default::default()
    };
    let ids: Vec<Uuid> = store
        .list_jobs(&both)
        .await
        .unwrap()
        .iter()
        .map(|r| r.job_id)
        .collect();
    assert_eq!(ids, vec![middle.job_id, newest.job_id, oldest.job_id]);

    let bob_alpha = ListJobsQuery {
        process_ids: vec![alpha.clone()],
        submitters: vec!["bob".to_string()],
        ..Default::default()
    };
    let found = store.list_jobs(&bob_alpha).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].job_id, newest.job_id);

    let running = ListJobsQuery {
        process_ids: vec![alpha.clone(), beta.clone()],
        statuses: vec![JobStatus::Running],
        ..Default::default()
    };
    assert_eq!(store.list_jobs(&running).await.unwrap().len(), 1);

    let page = ListJobsQuery {
        process_ids: vec![alpha.clone(), beta.clone()],
        limit: Some(1),
        offset: Some(1),
        ..Default::default()
    };
    let page = store.list_jobs(&page).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].job_id, newest.job_id);

    let past_end = ListJobsQuery {
        process_ids: vec![alpha.clone()],
        offset: Some(10),
        ..Default::default()
    };
    assert!(store.list_jobs(&past_end).await.unwrap().is_empty());

    // Logs are replaced, not appended.
    let mut logs = JobLogs {
        job_id: oldest.job_id,
        process_id: alpha.clone(),
        container_logs: vec!["first".to_string()],
        api_logs: vec![],
    };
    store.upsert_logs(&logs).await.unwrap();
    logs.container_logs = vec!["second".to_string(), "third".to_string()];
    logs.api_logs = vec!["closed".to_string()];
    store.upsert_logs(&logs).await.unwrap();
    assert_eq!(store.get_logs(oldest.job_id).await.unwrap(), Some(logs));
    assert!(store.get_logs(middle.job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cache_store_contract() {
    let cache = test_cache();
    exercise_store(&cache).await;
}

#[tokio::test]
async fn test_sqlite_store_contract() {
    let store = SqliteJobStore::connect("sqlite::memory:").await.unwrap();
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_postgres_store_contract() {
    skip_if_no_db!();
    let url = std::env::var("TEST_PROCESS_API_DATABASE_URL").unwrap();
    let store = PostgresJobStore::connect(&url).await.unwrap();
    exercise_store(&store).await;
}

#[tokio::test]
async fn test_sqlite_history_outlives_runtime() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    let store = Arc::new(SqliteJobStore::from_path(&path).await.unwrap());
    let ctx = TestContext::build(
        MockContainerBackend::new().with_logs(["{\"plugin_results\": {\"n\": 1}}"]),
        MockBatchBackend::new(),
        store,
        None,
    )
    .await;
    let job_id = ctx
        .runtime
        .submit(local_spec(ExecutionMode::Sync))
        .await
        .unwrap()
        .job_id;
    ctx.wait_closed(job_id).await;
    ctx.runtime.shutdown().await.unwrap();

    let reopened = SqliteJobStore::from_path(&path).await.unwrap();
    let record = reopened.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Successful);
    assert_eq!(record.host, BackendKind::Local);
    assert_eq!(record.mode, ExecutionMode::Sync);
    let logs = reopened.get_logs(job_id).await.unwrap().unwrap();
    assert_eq!(logs.container_logs.len(), 1);
}
