// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server.
//!
//! Thin axum layer over [`crate::handlers`]: extract, delegate, map errors.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::Error;
use crate::handlers::{
    CallbackOutcome, ProcessHandlerState, StatusUpdateRequest, handle_dismiss, handle_get_job,
    handle_get_logs, handle_get_results, handle_list_jobs, handle_status_update, handle_submit,
};
use crate::job::{ExecutionMode, JobSpec, JobStatus};
use crate::store::ListJobsQuery;

type SharedState = Arc<ProcessHandlerState>;

/// Build the router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/{job_id}", get(get_job).delete(dismiss_job))
        .route("/jobs/{job_id}/logs", get(get_logs))
        .route("/jobs/{job_id}/results", get(get_results))
        .route("/jobs/{job_id}/status", put(status_callback))
        .with_state(state)
}

/// Serve until `shutdown` flips to `true`.
pub async fn run_http_server(
    listener: TcpListener,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server starting");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

// ============================================================================
// Errors
// ============================================================================

/// [`Error`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::InvalidSpec(_)
            | Error::InvalidRequest(_)
            | Error::InvalidState { .. }
            | Error::Submission(_) => StatusCode::BAD_REQUEST,
            Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.0.error_code(), "Request failed: {}", self.0);
        }
        let body = json!({
            "code": self.0.error_code(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============================================================================
// Routes
// ============================================================================

async fn submit_job(
    State(state): State<SharedState>,
    Json(spec): Json<JobSpec>,
) -> ApiResult<Response> {
    let mode = spec.mode;
    let response = handle_submit(&state, spec).await?;
    let status = match mode {
        ExecutionMode::Async => StatusCode::CREATED,
        ExecutionMode::Sync => StatusCode::OK,
    };
    Ok((status, Json(response)).into_response())
}

/// Query string of `GET /jobs`. List values are comma-separated.
#[derive(Debug, Default, Deserialize)]
struct ListJobsParams {
    limit: Option<i64>,
    offset: Option<i64>,
    #[serde(rename = "processID")]
    process_id: Option<String>,
    status: Option<String>,
    submitter: Option<String>,
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

impl TryFrom<ListJobsParams> for ListJobsQuery {
    type Error = Error;

    fn try_from(params: ListJobsParams) -> std::result::Result<Self, Error> {
        let statuses = split_list(params.status.as_deref())
            .iter()
            .map(|raw| raw.parse::<JobStatus>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::InvalidRequest(e.to_string()))?;

        Ok(ListJobsQuery {
            limit: params.limit,
            offset: params.offset,
            process_ids: split_list(params.process_id.as_deref()),
            statuses,
            submitters: split_list(params.submitter.as_deref()),
        })
    }
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(params): Query<ListJobsParams>,
) -> ApiResult<Response> {
    let query = ListJobsQuery::try_from(params)?;
    let jobs = handle_list_jobs(&state, &query).await?;
    Ok(Json(json!({ "jobs": jobs })).into_response())
}

async fn get_job(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(handle_get_job(&state, job_id).await?).into_response())
}

async fn get_logs(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(handle_get_logs(&state, job_id).await?).into_response())
}

async fn get_results(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(handle_get_results(&state, job_id).await?).into_response())
}

async fn dismiss_job(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Response> {
    Ok(Json(handle_dismiss(&state, job_id).await?).into_response())
}

async fn status_callback(
    State(state): State<SharedState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<StatusUpdateRequest>,
) -> ApiResult<Response> {
    let message = match handle_status_update(&state, job_id, request).await {
        Ok(CallbackOutcome::Queued) => "status update received",
        Ok(CallbackOutcome::NotActive) => "job is not active, status update ignored",
        // Unknown jobs are a caller error on this route, not a missing resource.
        Err(Error::JobNotFound(id)) => {
            return Err(Error::InvalidRequest(format!("job {id} not found")).into());
        }
        Err(e) => return Err(e.into()),
    };
    let body = json!({ "jobID": job_id, "message": message });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;

    #[test]
    fn test_error_status_codes() {
        let id = Uuid::new_v4();
        let cases = [
            (Error::InvalidSpec("empty".into()), StatusCode::BAD_REQUEST),
            (
                Error::InvalidState {
                    job_id: id,
                    status: JobStatus::Failed,
                },
                StatusCode::BAD_REQUEST,
            ),
            (Error::JobNotFound(id), StatusCode::NOT_FOUND),
            (
                Error::BackendUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                Error::Persistence(StoreError::NotFound(id)),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError(err).into_response().status(), expected);
        }
    }

    #[test]
    fn test_list_params_split_and_parse() {
        let params = ListJobsParams {
            limit: Some(500),
            process_id: Some("a, b,,".into()),
            status: Some("running,failed".into()),
            ..Default::default()
        };
        let query = ListJobsQuery::try_from(params).unwrap();
        assert_eq!(query.limit(), 100);
        assert_eq!(query.process_ids, vec!["a", "b"]);
        assert_eq!(query.statuses, vec![JobStatus::Running, JobStatus::Failed]);
        assert!(query.submitters.is_empty());

        let bad = ListJobsParams {
            status: Some("running,bogus".into()),
            ..Default::default()
        };
        assert!(matches!(
            ListJobsQuery::try_from(bad),
            Err(Error::InvalidRequest(_))
        ));
    }
}
