// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! What a job runs and where.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How the submitter waits for the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Caller blocks until the job is terminal and receives its results.
    #[serde(rename = "sync-execute")]
    Sync,
    /// Caller receives the job id immediately.
    #[serde(rename = "async-execute")]
    Async,
}

impl ExecutionMode {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sync => "sync-execute",
            ExecutionMode::Async => "async-execute",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sync-execute" => Ok(ExecutionMode::Sync),
            "async-execute" => Ok(ExecutionMode::Async),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

/// Execution substrate of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// Container on the local Docker engine.
    #[serde(rename = "local")]
    Local,
    /// AWS Batch job.
    #[serde(rename = "aws-batch")]
    AwsBatch,
}

impl BackendKind {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::AwsBatch => "aws-batch",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local" => Ok(BackendKind::Local),
            "aws-batch" => Ok(BackendKind::AwsBatch),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// Resource limits for one job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU cores (fractional allowed).
    pub cpus: f64,
    /// Memory limit in MiB.
    pub memory_mb: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            memory_mb: 512,
        }
    }
}

/// Backend placement of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HostSpec {
    /// Run on the local container runtime.
    Local,
    /// Submit to a batch queue using a registered job definition.
    AwsBatch {
        /// Job definition name or ARN.
        job_definition: String,
        /// Queue name or ARN.
        job_queue: String,
    },
}

impl HostSpec {
    /// Backend kind recorded for this placement.
    pub fn kind(&self) -> BackendKind {
        match self {
            HostSpec::Local => BackendKind::Local,
            HostSpec::AwsBatch { .. } => BackendKind::AwsBatch,
        }
    }
}

/// Everything needed to execute one process invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Process identifier.
    pub process_id: String,
    /// Process version.
    pub process_version: String,
    /// Sync or async execution.
    pub mode: ExecutionMode,
    /// Identity of the submitter.
    pub submitter: String,
    /// Container image URI.
    pub image: String,
    /// Command and arguments.
    pub command: Vec<String>,
    /// Names of host environment variables passed through to the workload.
    #[serde(default)]
    pub env_vars: Vec<String>,
    /// Named volume mounts, `name:/container/path` (local only).
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Resource limits.
    #[serde(default)]
    pub resources: Resources,
    /// Where the job runs.
    pub host: HostSpec,
}

impl JobSpec {
    /// Reject specs that cannot be executed.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() || self.command.iter().all(|arg| arg.trim().is_empty()) {
            return Err(Error::InvalidSpec("command must not be empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(Error::InvalidSpec("image must not be empty".to_string()));
        }
        if self.resources.cpus <= 0.0 || self.resources.memory_mb == 0 {
            return Err(Error::InvalidSpec(
                "resource limits must be positive".to_string(),
            ));
        }
        if let HostSpec::AwsBatch {
            job_definition,
            job_queue,
        } = &self.host
            && (job_definition.is_empty() || job_queue.is_empty())
        {
            return Err(Error::InvalidSpec(
                "batch jobs need a job definition and a queue".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the pass-through variables from the host environment.
    ///
    /// Unset variables resolve to an empty value.
    pub fn resolve_env(&self) -> HashMap<String, String> {
        self.env_vars
            .iter()
            .map(|name| (name.clone(), std::env::var(name).unwrap_or_default()))
            .collect()
    }

    /// Volume names referenced by the mounts.
    pub fn volume_names(&self) -> impl Iterator<Item = &str> {
        self.volumes
            .iter()
            .filter_map(|mount| mount.split(':').next())
            .filter(|name| !name.is_empty())
    }
}
