// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end job lifecycle tests against mock backends.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{TestContext, batch_spec, local_spec, wait_for};
use process_api::Error;
use process_api::backend::{MockBatchBackend, MockContainerBackend};
use process_api::job::{ExecutionMode, JobStatus};
use process_api::storage::ObjectStore;
use process_api::store::{JobRecordStore, ListJobsQuery};

#[tokio::test]
async fn test_local_sync_job_reports_results() {
    let ctx = TestContext::with_backends(
        MockContainerBackend::new().with_logs(["working", "{'plugin_results': {'answer': 42}}"]),
        MockBatchBackend::new(),
    )
    .await;

    let response = ctx
        .runtime
        .submit(local_spec(ExecutionMode::Sync))
        .await
        .unwrap();
    assert_eq!(response.status, JobStatus::Successful);
    assert_eq!(response.results, Some(json!({"answer": 42})));

    let job_id = response.job_id;
    ctx.wait_closed(job_id).await;

    assert_eq!(
        ctx.store.history(job_id),
        vec![
            JobStatus::Accepted,
            JobStatus::Running,
            JobStatus::Successful
        ]
    );
    assert_eq!(ctx.containers.removed(), vec![format!("mock_{job_id}")]);

    // Logs and results survive the job leaving the registry.
    let logs = ctx.runtime.logs(job_id).await.unwrap();
    assert_eq!(logs.container_logs.len(), 2);
    assert!(logs.api_logs.iter().any(|line| line.contains("Job created.")));
    assert_eq!(
        ctx.runtime.results(job_id).await.unwrap(),
        json!({"answer": 42})
    );

    // Metadata is written asynchronously after close may already be done.
    let metadata_key = format!("metadata/{job_id}.json");
    let objects = ctx.objects.clone();
    wait_for(Duration::from_secs(2), || {
        let objects = objects.clone();
        let key = metadata_key.clone();
        async move { objects.exists(&key).await.unwrap() }
    })
    .await;
    let metadata = ctx.objects.get_json(&metadata_key).await.unwrap().unwrap();
    assert_eq!(metadata["apiJobId"], json!(job_id.to_string()));
    assert_eq!(metadata["process"]["processId"], json!("echo"));
    assert_eq!(metadata["image"]["imageURI"], json!("alpine:3"));
    assert_eq!(ctx.objects.put_count(&format!("logs/{job_id}.json")), 1);
}

#[tokio::test]
async fn test_local_job_nonzero_exit_fails() {
    let ctx = TestContext::with_backends(
        MockContainerBackend::new().with_exit_code(137),
        MockBatchBackend::new(),
    )
    .await;

    let response = ctx
        .runtime
        .submit(local_spec(ExecutionMode::Sync))
        .await
        .unwrap();
    assert_eq!(response.status, JobStatus::Failed);
    assert_eq!(response.results, None);

    ctx.wait_closed(response.job_id).await;
    let logs = ctx.runtime.logs(response.job_id).await.unwrap();
    assert!(
        logs.api_logs
            .iter()
            .any(|line| line.contains("container failure, exit code: 137"))
    );
    assert!(matches!(
        ctx.runtime.results(response.job_id).await,
        Err(Error::InvalidState {
            status: JobStatus::Failed,
            ..
        })
    ));
    assert!(
        !ctx.objects
            .exists(&format!("metadata/{}.json", response.job_id))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_unreachable_container_runtime_rejects_submission() {
    let ctx =
        TestContext::with_backends(MockContainerBackend::unreachable(), MockBatchBackend::new())
            .await;

    let result = ctx.runtime.submit(local_spec(ExecutionMode::Async)).await;
    assert!(matches!(result, Err(Error::BackendUnavailable(_))));
    assert!(ctx.runtime.registry().is_empty());
    assert!(
        ctx.store
            .list_jobs(&ListJobsQuery::default())
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_batch_job_follows_remote_status() {
    let ctx = TestContext::with_backends(
        MockContainerBackend::new(),
        MockBatchBackend::new().with_statuses([
            "SUBMITTED",
            "RUNNABLE",
            "STARTING",
            "RUNNING",
            "RUNNING",
            "SUCCEEDED",
        ]),
    )
    .await;

    let job_id = ctx
        .runtime
        .submit(batch_spec(ExecutionMode::Async))
        .await
        .unwrap()
        .job_id;
    ctx.wait_closed(job_id).await;

    assert_eq!(
        ctx.store.history(job_id),
        vec![
            JobStatus::Accepted,
            JobStatus::Running,
            JobStatus::Successful
        ]
    );

    let submissions = ctx.batch.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].name, format!("test-server_{job_id}"));

    let logs = ctx.runtime.logs(job_id).await.unwrap();
    assert_eq!(logs.container_logs, vec!["batch output".to_string()]);
}

#[tokio::test]
async fn test_batch_job_remote_failure() {
    let ctx = TestContext::with_backends(
        MockContainerBackend::new(),
        MockBatchBackend::new().with_statuses(["RUNNING", "FAILED"]),
    )
    .await;

    let job_id = ctx
        .runtime
        .submit(batch_spec(ExecutionMode::Sync))
        .await
        .unwrap()
        .job_id;
    ctx.wait_closed(job_id).await;

    let record = ctx.runtime.status(job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_dismiss_running_batch_job() {
    let ctx = TestContext::with_backends(
        MockContainerBackend::new(),
        MockBatchBackend::new().with_statuses(["RUNNING"]),
    )
    .await;

    let job_id = ctx
        .runtime
        .submit(batch_spec(ExecutionMode::Async))
        .await
        .unwrap()
        .job_id;

    ctx.wait_status(job_id, JobStatus::Running).await;

    let record = ctx.runtime.dismiss(job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Dismissed);
    assert_eq!(ctx.batch.terminated().len(), 1);
    assert!(ctx.batch.cancelled().is_empty());

    ctx.wait_closed(job_id).await;
    assert_eq!(
        ctx.store.get_job(job_id).await.unwrap().unwrap().status,
        JobStatus::Dismissed
    );
    assert!(matches!(
        ctx.runtime.dismiss(job_id).await,
        Err(Error::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_list_jobs_filters_and_clamps() {
    let ctx = TestContext::new().await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            ctx.runtime
                .submit(local_spec(ExecutionMode::Sync))
                .await
                .unwrap()
                .job_id,
        );
    }
    let mut other = local_spec(ExecutionMode::Sync);
    other.process_id = "other".to_string();
    ctx.runtime.submit(other).await.unwrap();

    let echo = ctx
        .runtime
        .list_jobs(&ListJobsQuery {
            process_ids: vec!["echo".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(echo.len(), 3);
    assert!(echo.iter().all(|r| ids.contains(&r.job_id)));
    assert!(echo.windows(2).all(|w| w[0].updated >= w[1].updated));

    let one = ctx
        .runtime
        .list_jobs(&ListJobsQuery {
            limit: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(one.len(), 1);

    let past_end = ctx
        .runtime
        .list_jobs(&ListJobsQuery {
            offset: Some(50),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(past_end.is_empty());
}
