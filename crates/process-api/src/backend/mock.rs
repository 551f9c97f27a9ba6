// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backends for testing.
//!
//! Scriptable stand-ins for Docker and AWS Batch that simulate execution
//! without any external service.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;

use super::traits::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: ContainerSpec,
    killed: bool,
    times: ExecutionTimes,
}

#[derive(Debug, Default)]
struct ContainerState {
    containers: HashMap<String, MockContainer>,
    started: Vec<ContainerSpec>,
    pulled: Vec<String>,
    volumes: Vec<String>,
    removed: Vec<String>,
    killed: Vec<String>,
    killed_ids: Vec<String>,
}

/// Mock container runtime.
pub struct MockContainerBackend {
    /// Exit code reported when a container finishes on its own.
    pub exit_code: i64,
    /// Log lines every container produces.
    pub logs: Vec<String>,
    /// Simulated execution time.
    pub run_delay: Duration,
    /// Containers only stop when killed.
    pub never_exit: bool,
    /// Every call fails as if the daemon were down.
    pub unreachable: bool,
    /// Image digest reported for every image.
    pub digest: Option<String>,
    /// Latency of every ping.
    pub ping_delay: Duration,
    state: Mutex<ContainerState>,
    changed: Notify,
}

impl Default for MockContainerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerBackend {
    /// Containers print `hi` and exit 0 after 10ms.
    pub fn new() -> Self {
        Self {
            exit_code: 0,
            logs: vec!["hi".to_string()],
            run_delay: Duration::from_millis(10),
            never_exit: false,
            unreachable: false,
            digest: Some("sha256:0123456789abcdef".to_string()),
            ping_delay: Duration::ZERO,
            state: Mutex::new(ContainerState::default()),
            changed: Notify::new(),
        }
    }

    /// Containers exit with `code`.
    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    /// Containers print `logs`.
    pub fn with_logs<I, S>(mut self, logs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.logs = logs.into_iter().map(Into::into).collect();
        self
    }

    /// Pings take `delay` to answer.
    pub fn with_ping_delay(mut self, delay: Duration) -> Self {
        self.ping_delay = delay;
        self
    }

    /// Containers run until killed.
    pub fn never_exiting() -> Self {
        Self {
            never_exit: true,
            ..Self::new()
        }
    }

    /// The daemon cannot be reached.
    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::new()
        }
    }

    /// Specs of every container started.
    pub fn started(&self) -> Vec<ContainerSpec> {
        lock(&self.state).started.clone()
    }

    /// Images pulled.
    pub fn pulled(&self) -> Vec<String> {
        lock(&self.state).pulled.clone()
    }

    /// Volumes created.
    pub fn volumes(&self) -> Vec<String> {
        lock(&self.state).volumes.clone()
    }

    /// Containers removed, in order.
    pub fn removed(&self) -> Vec<String> {
        lock(&self.state).removed.clone()
    }

    /// Containers killed, in order.
    pub fn killed(&self) -> Vec<String> {
        lock(&self.state).killed.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(BackendError::Unavailable(
                "connection refused (mock)".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for MockContainerBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        if !self.ping_delay.is_zero() {
            tokio::time::sleep(self.ping_delay).await;
        }
        self.check_reachable()
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = lock(&self.state);
        if !state.pulled.iter().any(|i| i == image) {
            state.pulled.push(image.to_string());
        }
        Ok(())
    }

    async fn ensure_volume(&self, name: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = lock(&self.state);
        if !state.volumes.iter().any(|v| v == name) {
            state.volumes.push(name.to_string());
        }
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.check_reachable()?;
        let id = format!("mock_{}", spec.name);
        let now = Utc::now();
        let mut state = lock(&self.state);
        if state.containers.contains_key(&id) {
            return Err(BackendError::Rejected(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        state.started.push(spec.clone());
        state.containers.insert(
            id.clone(),
            MockContainer {
                spec: spec.clone(),
                killed: false,
                times: ExecutionTimes {
                    created: Some(now),
                    started: Some(now),
                    ended: None,
                },
            },
        );
        Ok(id)
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64> {
        self.check_reachable()?;
        let deadline =
            (!self.never_exit).then(|| tokio::time::Instant::now() + self.run_delay);

        loop {
            let notified = self.changed.notified();
            {
                let state = lock(&self.state);
                match state.containers.get(container_id) {
                    None if state.killed_ids.iter().any(|id| id == container_id) => {
                        return Ok(137);
                    }
                    None => return Err(BackendError::NotFound(container_id.to_string())),
                    Some(c) if c.killed => return Ok(137),
                    Some(_) => {}
                }
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => continue,
                        _ = tokio::time::sleep_until(deadline) => {
                            let mut state = lock(&self.state);
                            if let Some(c) = state.containers.get_mut(container_id) {
                                c.times.ended = Some(Utc::now());
                            }
                            return Ok(self.exit_code);
                        }
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn container_logs(&self, container_id: &str) -> Result<Vec<String>> {
        self.check_reachable()?;
        let state = lock(&self.state);
        if !state.containers.contains_key(container_id) {
            return Err(BackendError::NotFound(container_id.to_string()));
        }
        Ok(self.logs.clone())
    }

    async fn container_times(&self, container_id: &str) -> Result<ExecutionTimes> {
        self.check_reachable()?;
        lock(&self.state)
            .containers
            .get(container_id)
            .map(|c| c.times)
            .ok_or_else(|| BackendError::NotFound(container_id.to_string()))
    }

    async fn container_exists(&self, container_id: &str) -> Result<bool> {
        self.check_reachable()?;
        Ok(lock(&self.state).containers.contains_key(container_id))
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = lock(&self.state);
        if state.containers.remove(container_id).is_none() {
            return Err(BackendError::NotFound(container_id.to_string()));
        }
        state.removed.push(container_id.to_string());
        Ok(())
    }

    async fn kill_and_remove(&self, container_id: &str) -> Result<()> {
        self.check_reachable()?;
        {
            let mut state = lock(&self.state);
            let Some(container) = state.containers.get_mut(container_id) else {
                return Ok(());
            };
            container.killed = true;
            container.times.ended = Some(Utc::now());
            let name = container.spec.name.clone();
            state.killed.push(name);
            state.killed_ids.push(container_id.to_string());
            state.containers.remove(container_id);
            state.removed.push(container_id.to_string());
        }
        self.changed.notify_waiters();
        Ok(())
    }

    async fn image_digest(&self, _image: &str) -> Result<Option<String>> {
        self.check_reachable()?;
        Ok(self.digest.clone())
    }
}

#[derive(Debug, Default)]
struct BatchState {
    script: VecDeque<BatchJobDescription>,
    current: BatchJobDescription,
    submissions: Vec<BatchSubmission>,
    cancelled: Vec<String>,
    terminated: Vec<String>,
    describe_calls: u32,
    log_calls: u32,
}

/// Mock batch service.
///
/// Every submitted job shares one scripted status sequence: each describe
/// call advances to the next scripted status and then stays on the last.
pub struct MockBatchBackend {
    /// Log lines returned by a successful fetch.
    pub logs: Vec<String>,
    /// Submissions are refused.
    pub reject_submissions: bool,
    /// Every call fails as if the service were down.
    pub unreachable: bool,
    /// Cancel and terminate calls fail.
    pub fail_kills: bool,
    /// Image reported by job definitions.
    pub image: String,
    log_failures: AtomicU32,
    state: Mutex<BatchState>,
}

impl Default for MockBatchBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBatchBackend {
    /// Jobs stay `SUBMITTED` until a script is set.
    pub fn new() -> Self {
        Self {
            logs: vec!["batch output".to_string()],
            reject_submissions: false,
            unreachable: false,
            fail_kills: false,
            image: "123456789.dkr.ecr.us-east-1.amazonaws.com/process:1".to_string(),
            log_failures: AtomicU32::new(0),
            state: Mutex::new(BatchState {
                current: BatchJobDescription {
                    status: "SUBMITTED".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            }),
        }
    }

    /// Describe calls walk through `statuses`.
    pub fn with_statuses<I, S>(self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = lock(&self.state);
            state.script = statuses
                .into_iter()
                .map(|status| BatchJobDescription {
                    status: status.into(),
                    log_stream: Some("process/default/stream".to_string()),
                    ..Default::default()
                })
                .collect();
        }
        self
    }

    /// Append a status with an explicit reason.
    pub fn push_status(&self, status: &str, reason: Option<&str>) {
        lock(&self.state).script.push_back(BatchJobDescription {
            status: status.to_string(),
            status_reason: reason.map(str::to_string),
            log_stream: Some("process/default/stream".to_string()),
            ..Default::default()
        });
    }

    /// The next `n` log fetches fail.
    pub fn fail_log_fetches(&self, n: u32) {
        self.log_failures.store(n, Ordering::SeqCst);
    }

    /// Submissions received.
    pub fn submissions(&self) -> Vec<BatchSubmission> {
        lock(&self.state).submissions.clone()
    }

    /// Jobs cancelled.
    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.state).cancelled.clone()
    }

    /// Jobs terminated.
    pub fn terminated(&self) -> Vec<String> {
        lock(&self.state).terminated.clone()
    }

    /// Number of describe calls served.
    pub fn describe_calls(&self) -> u32 {
        lock(&self.state).describe_calls
    }

    /// Number of log fetches attempted.
    pub fn log_calls(&self) -> u32 {
        lock(&self.state).log_calls
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable {
            return Err(BackendError::Unavailable(
                "batch endpoint unreachable (mock)".to_string(),
            ));
        }
        Ok(())
    }

    fn stop_with(&self, reason: &str) {
        let mut state = lock(&self.state);
        state.script.clear();
        state.current = BatchJobDescription {
            status: "FAILED".to_string(),
            status_reason: Some(reason.to_string()),
            log_stream: state.current.log_stream.clone(),
            ..Default::default()
        };
    }
}

#[async_trait]
impl BatchBackend for MockBatchBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn submit_job(&self, submission: &BatchSubmission) -> Result<String> {
        self.check_reachable()?;
        if self.reject_submissions {
            return Err(BackendError::Rejected(format!(
                "job queue {} is disabled",
                submission.job_queue
            )));
        }
        let mut state = lock(&self.state);
        state.submissions.push(submission.clone());
        Ok(format!("batch-{}", state.submissions.len()))
    }

    async fn describe_job(&self, _batch_id: &str) -> Result<BatchJobDescription> {
        self.check_reachable()?;
        let mut state = lock(&self.state);
        state.describe_calls += 1;
        if let Some(next) = state.script.pop_front() {
            state.current = next;
        }
        Ok(state.current.clone())
    }

    async fn cancel_job(&self, batch_id: &str, reason: &str) -> Result<()> {
        self.check_reachable()?;
        if self.fail_kills {
            return Err(BackendError::Unavailable("cancel failed (mock)".to_string()));
        }
        lock(&self.state).cancelled.push(batch_id.to_string());
        self.stop_with(reason);
        Ok(())
    }

    async fn terminate_job(&self, batch_id: &str, reason: &str) -> Result<()> {
        self.check_reachable()?;
        if self.fail_kills {
            return Err(BackendError::Unavailable(
                "terminate failed (mock)".to_string(),
            ));
        }
        lock(&self.state).terminated.push(batch_id.to_string());
        self.stop_with(reason);
        Ok(())
    }

    async fn describe_job_definition(&self, job_definition: &str) -> Result<JobDefinitionInfo> {
        self.check_reachable()?;
        if job_definition.is_empty() {
            return Err(BackendError::NotFound("job definition".to_string()));
        }
        Ok(JobDefinitionInfo {
            image: self.image.clone(),
            vcpus: Some(1.0),
            memory_mb: Some(2048),
        })
    }

    async fn log_events(&self, log_stream: &str) -> Result<Vec<String>> {
        lock(&self.state).log_calls += 1;
        self.check_reachable()?;
        let remaining = self.log_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.log_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::Api(format!(
                "throttled reading {log_stream} (mock)"
            )));
        }
        Ok(self.logs.clone())
    }
}
