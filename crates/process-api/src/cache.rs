// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded in-memory job store.
//!
//! Used when no database is configured. Every job's record and final logs
//! are held in memory under an approximate byte budget. [`CacheMonitor`]
//! checks the budget periodically: above 95% of `max_size_bytes` the cache
//! drops the least-recently-updated terminal jobs until it is back under
//! `trim_fraction` of the budget.
//!
//! Evicted jobs are gone for good. The only durability is an optional JSON
//! snapshot written on shutdown and loaded on startup.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::CacheSettings;
use crate::job::{JobLogs, JobStatus};
use crate::store::{JobRecord, JobRecordStore, ListJobsQuery, StoreError};

/// Fraction of the budget that triggers a trim.
pub const TRIM_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    record: JobRecord,
    #[serde(default)]
    logs: Option<JobLogs>,
}

impl CacheEntry {
    fn size(&self) -> u64 {
        self.record.approx_size() + self.logs.as_ref().map_or(0, JobLogs::approx_size)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Uuid, CacheEntry>,
    total: u64,
}

impl CacheState {
    fn insert(&mut self, entry: CacheEntry) {
        let id = entry.record.job_id;
        self.total += entry.size();
        if let Some(previous) = self.entries.insert(id, entry) {
            self.total -= previous.size();
        }
    }

    /// Apply `f` to an entry and keep the byte total in step.
    fn update<F>(&mut self, id: Uuid, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut CacheEntry),
    {
        let entry = self.entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let before = entry.size();
        f(entry);
        let after = entry.size();
        self.total = self.total - before + after;
        Ok(())
    }
}

/// In-memory [`JobRecordStore`] with a size budget.
pub struct BoundedJobCache {
    settings: CacheSettings,
    state: Mutex<CacheState>,
}

impl BoundedJobCache {
    /// Empty cache.
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cache seeded from the configured snapshot, if one exists.
    pub async fn load(settings: CacheSettings) -> Result<Self, StoreError> {
        let cache = Self::new(settings);
        let Some(path) = cache.settings.snapshot_path.clone() else {
            return Ok(cache);
        };
        if !tokio::fs::try_exists(&path).await? {
            debug!(path = %path.display(), "No cache snapshot to load");
            return Ok(cache);
        }

        let bytes = tokio::fs::read(&path).await?;
        let entries: Vec<CacheEntry> = serde_json::from_slice(&bytes)?;
        let count = entries.len();
        {
            let mut state = cache.lock();
            for entry in entries {
                state.insert(entry);
            }
        }
        info!(path = %path.display(), jobs = count, "Loaded cache snapshot");
        Ok(cache)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Limits this cache enforces.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Approximate bytes held.
    pub fn total_size(&self) -> u64 {
        self.lock().total
    }

    /// Number of jobs held.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether the cache holds no jobs.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Whether a job is held.
    pub fn contains(&self, job_id: Uuid) -> bool {
        self.lock().entries.contains_key(&job_id)
    }

    /// Evict old terminal jobs if the cache is over its threshold.
    ///
    /// Returns the number of evicted jobs.
    pub fn check_and_trim(&self) -> usize {
        let max = self.settings.max_size_bytes as f64;
        let mut state = self.lock();
        if (state.total as f64) <= max * TRIM_THRESHOLD {
            return 0;
        }

        let target = max * self.settings.trim_fraction;
        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = state
            .entries
            .values()
            .filter(|entry| entry.record.status.is_terminal())
            .map(|entry| (entry.record.updated, entry.record.job_id))
            .collect();
        candidates.sort();

        let before = state.total;
        let mut evicted = 0;
        for (_, id) in candidates {
            if (state.total as f64) <= target {
                break;
            }
            if let Some(entry) = state.entries.remove(&id) {
                state.total -= entry.size();
                evicted += 1;
            }
        }

        if (state.total as f64) > target {
            warn!(
                total_bytes = state.total,
                target_bytes = target as u64,
                "Cache still over budget; remaining jobs are active"
            );
        }
        info!(
            evicted,
            before_bytes = before,
            after_bytes = state.total,
            "Trimmed job cache"
        );
        evicted
    }

    /// Write every entry to the configured snapshot path.
    ///
    /// The file is replaced atomically.
    pub async fn snapshot(&self) -> Result<(), StoreError> {
        let Some(path) = self.settings.snapshot_path.as_deref() else {
            return Ok(());
        };
        let entries: Vec<CacheEntry> = self.lock().entries.values().cloned().collect();
        write_snapshot(path, &entries).await?;
        info!(path = %path.display(), jobs = entries.len(), "Wrote cache snapshot");
        Ok(())
    }
}

async fn write_snapshot(path: &Path, entries: &[CacheEntry]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    let bytes = serde_json::to_vec(entries)?;
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl JobRecordStore for BoundedJobCache {
    fn store_type(&self) -> &'static str {
        "cache"
    }

    async fn add_job(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.lock().insert(CacheEntry {
            record: record.clone(),
            logs: None,
        });
        Ok(())
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        updated: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.lock().update(job_id, |entry| {
            entry.record.status = status;
            entry.record.updated = updated;
        })
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .lock()
            .entries
            .get(&job_id)
            .map(|entry| entry.record.clone()))
    }

    async fn list_jobs(&self, query: &ListJobsQuery) -> Result<Vec<JobRecord>, StoreError> {
        let mut records: Vec<JobRecord> = self
            .lock()
            .entries
            .values()
            .filter(|entry| query.matches(&entry.record))
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by(|a, b| {
            b.updated
                .cmp(&a.updated)
                .then_with(|| b.job_id.cmp(&a.job_id))
        });

        Ok(records
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.limit() as usize)
            .collect())
    }

    async fn upsert_logs(&self, logs: &JobLogs) -> Result<(), StoreError> {
        self.lock().update(logs.job_id, |entry| {
            entry.logs = Some(logs.clone());
        })
    }

    async fn get_logs(&self, job_id: Uuid) -> Result<Option<JobLogs>, StoreError> {
        Ok(self
            .lock()
            .entries
            .get(&job_id)
            .and_then(|entry| entry.logs.clone()))
    }

    async fn close(&self) {
        if let Err(e) = self.snapshot().await {
            error!(error = %e, "Failed to write cache snapshot");
        }
    }
}

/// Background worker that keeps the cache within budget.
pub struct CacheMonitor {
    cache: Arc<BoundedJobCache>,
    shutdown: Arc<Notify>,
}

impl CacheMonitor {
    /// Monitor `cache` at its configured check interval.
    pub fn new(cache: Arc<BoundedJobCache>) -> Self {
        Self {
            cache,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        let interval = self.cache.settings.check_interval;
        info!(
            check_interval_secs = interval.as_secs(),
            max_size_bytes = self.cache.settings.max_size_bytes,
            "Cache monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Cache monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(interval) => {
                    let evicted = self.cache.check_and_trim();
                    debug!(
                        evicted,
                        total_bytes = self.cache.total_size(),
                        jobs = self.cache.len(),
                        "Cache size checked"
                    );
                }
            }
        }

        info!("Cache monitor stopped");
    }
}
