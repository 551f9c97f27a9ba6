// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provenance documents for successful jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::ExecutionTimes;
use crate::job::JobSpec;

/// JSON-LD context of the provenance vocabulary.
pub const METADATA_CONTEXT: &str =
    "https://github.com/Dewberry/process-api/blob/main/context.jsonld";

/// Process that produced the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRef {
    /// Process identifier.
    #[serde(rename = "processId")]
    pub process_id: String,
    /// Process version.
    #[serde(rename = "processVersion")]
    pub process_version: String,
}

/// Image the job ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Image URI.
    #[serde(rename = "imageURI")]
    pub uri: String,
    /// Content digest, when the backend can resolve one.
    #[serde(rename = "imageDigest")]
    pub digest: Option<String>,
}

/// Provenance of one successful job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    /// JSON-LD context.
    #[serde(rename = "@context")]
    pub context: String,
    /// Job identifier.
    #[serde(rename = "apiJobId")]
    pub job_id: Uuid,
    /// Producing process.
    pub process: ProcessRef,
    /// Executed image.
    pub image: ImageRef,
    /// Command the workload ran.
    #[serde(rename = "containerCommands")]
    pub commands: Vec<String>,
    /// When the backend created the unit of work.
    #[serde(rename = "generatedAtTime")]
    pub generated_at: Option<DateTime<Utc>>,
    /// When execution started.
    #[serde(rename = "startedAtTime")]
    pub started_at: Option<DateTime<Utc>>,
    /// When execution ended.
    #[serde(rename = "endedAtTime")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobMetadata {
    /// Assemble the document for a job.
    pub fn new(
        job_id: Uuid,
        spec: &JobSpec,
        image_uri: impl Into<String>,
        image_digest: Option<String>,
        times: ExecutionTimes,
    ) -> Self {
        Self {
            context: METADATA_CONTEXT.to_string(),
            job_id,
            process: ProcessRef {
                process_id: spec.process_id.clone(),
                process_version: spec.process_version.clone(),
            },
            image: ImageRef {
                uri: image_uri.into(),
                digest: image_digest,
            },
            commands: spec.command.clone(),
            generated_at: times.created,
            started_at: times.started,
            ended_at: times.ended,
        }
    }
}
