// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for process-api.

use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;
use crate::job::JobStatus;
use crate::store::StoreError;

/// Job orchestration errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The submitted job is malformed (empty command, missing batch target).
    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    /// The execution backend could not be reached or timed out.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The execution backend rejected the job.
    #[error("Submission rejected: {0}")]
    Submission(String),

    /// A request carried an unusable value (e.g. an unknown status).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The operation is not valid for the job's current status.
    #[error("Job {job_id} is {status}, operation not allowed")]
    InvalidState {
        /// Job the operation targeted.
        job_id: Uuid,
        /// Status at the time of the request.
        status: JobStatus,
    },

    /// The final log line did not carry a results object.
    #[error("Unable to parse results, expected {{\"plugin_results\": {{....}}}}, found: {0}")]
    ResultsParse(String),

    /// Remote logs could not be fetched within the retry budget.
    #[error("Log fetch failed after {attempts} attempts: {reason}")]
    LogFetch {
        /// Number of attempts made.
        attempts: u32,
        /// Last failure reported by the backend.
        reason: String,
    },

    /// Record store operation failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Job is neither active nor recorded.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidSpec(_) => "INVALID_SPEC",
            Self::BackendUnavailable(_) => "BACKEND_UNAVAILABLE",
            Self::Submission(_) => "SUBMISSION_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ResultsParse(_) => "RESULTS_PARSE_ERROR",
            Self::LogFetch { .. } => "LOG_FETCH_ERROR",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(msg) => Error::Submission(msg),
            other => Error::BackendUnavailable(other.to_string()),
        }
    }
}

/// Result type using process-api Error.
pub type Result<T> = std::result::Result<T, Error>;
