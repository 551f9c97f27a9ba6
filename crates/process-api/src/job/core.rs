// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bookkeeping shared by every job variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::logs::JobLogs;
use super::spec::JobSpec;
use super::state::{JobStatus, Transition};
use crate::backend::ExecutionTimes;
use crate::error::Result;
use crate::store::{JobRecord, JobRecordStore};

/// Severity of an API log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Informational.
    Info,
    /// Degraded but continuing.
    Warn,
    /// Failure.
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warning",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    updated: DateTime<Utc>,
    handle: Option<String>,
    api_logs: Vec<String>,
    container_logs: Vec<String>,
    results: Option<Value>,
    times: ExecutionTimes,
}

/// Identity, status and logs of one job.
///
/// Status changes go through [`JobCore::transition`], which serializes them
/// per job and writes each accepted change to the record store before
/// returning.
pub struct JobCore {
    id: Uuid,
    spec: JobSpec,
    store: Arc<dyn JobRecordStore>,
    state: Mutex<JobState>,
    transition_lock: tokio::sync::Mutex<()>,
    status_tx: watch::Sender<JobStatus>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl JobCore {
    /// New job in `accepted`.
    pub fn new(id: Uuid, spec: JobSpec, store: Arc<dyn JobRecordStore>) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Accepted);
        Self {
            id,
            spec,
            store,
            state: Mutex::new(JobState {
                status: JobStatus::Accepted,
                updated: Utc::now(),
                handle: None,
                api_logs: Vec::new(),
                container_logs: Vec::new(),
                results: None,
                times: ExecutionTimes::default(),
            }),
            transition_lock: tokio::sync::Mutex::new(()),
            status_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Job identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// What the job runs.
    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    /// Time of the last status change.
    pub fn last_update(&self) -> DateTime<Utc> {
        self.lock().updated
    }

    /// Backend-native handle (container id or batch job id).
    pub fn handle(&self) -> Option<String> {
        self.lock().handle.clone()
    }

    /// Record the backend-native handle.
    pub fn set_handle(&self, handle: impl Into<String>) {
        self.lock().handle = Some(handle.into());
    }

    /// Results reported by the workload.
    pub fn results(&self) -> Option<Value> {
        self.lock().results.clone()
    }

    /// Store the results reported by the workload.
    pub fn set_results(&self, results: Value) {
        self.lock().results = Some(results);
    }

    /// Backend timing captured so far.
    pub fn times(&self) -> ExecutionTimes {
        self.lock().times
    }

    /// Store backend timing.
    pub fn set_times(&self, times: ExecutionTimes) {
        self.lock().times = times;
    }

    /// Workload log lines captured so far.
    pub fn container_logs(&self) -> Vec<String> {
        self.lock().container_logs.clone()
    }

    /// Replace the captured workload logs.
    pub fn set_container_logs(&self, lines: Vec<String>) {
        self.lock().container_logs = lines;
    }

    /// Snapshot of both log streams.
    pub fn logs(&self) -> JobLogs {
        let state = self.lock();
        JobLogs {
            job_id: self.id,
            process_id: self.spec.process_id.clone(),
            container_logs: state.container_logs.clone(),
            api_logs: state.api_logs.clone(),
        }
    }

    /// Record a lifecycle message in the job's API log and the server log.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(job_id = %self.id, "{}", message),
            LogLevel::Warn => warn!(job_id = %self.id, "{}", message),
            LogLevel::Error => error!(job_id = %self.id, "{}", message),
        }
        let line = format!(
            "{} {}: {}",
            Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level.as_str(),
            message
        );
        self.lock().api_logs.push(line);
    }

    /// Durable projection of the job.
    pub fn record(&self) -> JobRecord {
        let state = self.lock();
        JobRecord {
            job_id: self.id,
            status: state.status,
            updated: state.updated,
            process_id: self.spec.process_id.clone(),
            mode: self.spec.mode,
            host: self.spec.host.kind(),
            submitter: self.spec.submitter.clone(),
        }
    }

    /// Write the initial record.
    pub async fn persist_initial(&self) -> Result<()> {
        self.store.add_job(&self.record()).await?;
        Ok(())
    }

    /// Apply a status change if the state machine allows it.
    ///
    /// The in-memory status advances even when the store write fails; the
    /// failure is logged at error level.
    pub async fn transition(&self, next: JobStatus, at: Option<DateTime<Utc>>) -> Transition {
        let _serialized = self.transition_lock.lock().await;

        let updated = {
            let mut state = self.lock();
            if !state.status.can_transition_to(next) {
                debug!(
                    job_id = %self.id,
                    current = %state.status,
                    requested = %next,
                    "Status update ignored"
                );
                return Transition::Ignored;
            }
            state.status = next;
            state.updated = at.unwrap_or_else(Utc::now);
            state.updated
        };
        self.status_tx.send_replace(next);

        if let Err(e) = self.store.update_status(self.id, next, updated).await {
            error!(
                job_id = %self.id,
                status = %next,
                error = %e,
                "Failed to persist status; record store is behind in-memory state"
            );
            self.lock()
                .api_logs
                .push(format!("{updated} error: status {next} not persisted: {e}"));
        }

        self.log(LogLevel::Info, format!("Status changed to {next}."));
        Transition::Applied
    }

    /// Wait until the job reaches a terminal status, or until it is
    /// cancelled without reaching one. Returns the status at that point.
    pub async fn wait_terminal(&self) -> JobStatus {
        let mut rx = self.status_tx.subscribe();
        tokio::select! {
            biased;
            result = rx.wait_for(|status| status.is_terminal()) => match result {
                Ok(status) => *status,
                // The sender lives as long as `self`.
                Err(_) => self.status(),
            },
            _ = self.cancel.cancelled() => self.status(),
        }
    }

    /// The job's cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel the job's tasks. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Mark the job closed. Returns `true` only for the first caller.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Whether the job has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
