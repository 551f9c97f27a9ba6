// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job status state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
///
/// ```text
/// accepted ──► running ──┬──► successful
///     │                  ├──► failed
///     └──────────────────┴──► dismissed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted, not yet started on the backend.
    Accepted,
    /// Executing on the backend.
    Running,
    /// Finished with exit code zero.
    Successful,
    /// Finished with an error.
    Failed,
    /// Stopped by an explicit kill.
    Dismissed,
}

impl JobStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Accepted,
        JobStatus::Running,
        JobStatus::Successful,
        JobStatus::Failed,
        JobStatus::Dismissed,
    ];

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Accepted => "accepted",
            JobStatus::Running => "running",
            JobStatus::Successful => "successful",
            JobStatus::Failed => "failed",
            JobStatus::Dismissed => "dismissed",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Successful | JobStatus::Failed | JobStatus::Dismissed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Accepted => 0,
            JobStatus::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    ///
    /// Terminal statuses accept nothing. Re-applying the current status or
    /// moving backwards (`running → accepted`) is rejected.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("status not valid, valid options are: accepted, running, successful, failed, dismissed (got '{0}')")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Outcome of a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The status changed.
    Applied,
    /// The request was a no-op (terminal job, duplicate or backwards move).
    Ignored,
}

impl Transition {
    /// Whether the status changed.
    pub fn applied(&self) -> bool {
        matches!(self, Transition::Applied)
    }
}
