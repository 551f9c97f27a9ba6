// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job log bundles and result extraction.
//!
//! Workloads report results by printing a JSON object as their final log
//! line, e.g. `{"plugin_results": {"value": 42}}`. Single-quoted output
//! (`{'plugin_results': ...}`) is accepted as well.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Key under which workloads report results.
pub const RESULTS_KEY: &str = "plugin_results";

/// Logs of one job, split by origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLogs {
    /// Job the logs belong to.
    #[serde(rename = "jobID")]
    pub job_id: Uuid,
    /// Process the job executed.
    #[serde(rename = "processID")]
    pub process_id: String,
    /// Output produced by the workload itself.
    pub container_logs: Vec<String>,
    /// Lifecycle messages recorded by this server.
    pub api_logs: Vec<String>,
}

impl JobLogs {
    /// Approximate in-memory footprint in bytes.
    pub fn approx_size(&self) -> u64 {
        let lines: usize = self
            .container_logs
            .iter()
            .chain(self.api_logs.iter())
            .map(String::len)
            .sum();
        (16 + self.process_id.len() + lines) as u64
    }
}

/// Extract the results object from the final non-empty log line.
pub fn extract_results(container_logs: &[String]) -> Result<Value> {
    let last = container_logs
        .iter()
        .rev()
        .map(|line| line.trim())
        .find(|line| !line.is_empty())
        .unwrap_or_default();

    let normalised = last.replace('\'', "\"");
    let parsed: Value =
        serde_json::from_str(&normalised).map_err(|_| Error::ResultsParse(last.to_string()))?;

    parsed
        .get(RESULTS_KEY)
        .cloned()
        .ok_or_else(|| Error::ResultsParse(last.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_results_from_last_line() {
        let logs = lines(&["starting", "{\"plugin_results\": {\"answer\": 42}}"]);
        assert_eq!(extract_results(&logs).unwrap(), json!({"answer": 42}));
    }

    #[test]
    fn test_extract_results_single_quotes_and_trailing_blank() {
        let logs = lines(&["{'plugin_results': {'files': ['a.tif']}}", ""]);
        assert_eq!(extract_results(&logs).unwrap(), json!({"files": ["a.tif"]}));
    }

    #[test]
    fn test_extract_results_rejects_plain_text() {
        let logs = lines(&["hi"]);
        let err = extract_results(&logs).unwrap_err();
        assert!(matches!(err, Error::ResultsParse(ref found) if found == "hi"));
    }

    #[test]
    fn test_extract_results_requires_key() {
        let logs = lines(&["{\"other\": 1}"]);
        assert!(extract_results(&logs).is_err());
        assert!(extract_results(&[]).is_err());
    }

    #[test]
    fn test_logs_wire_names() {
        let logs = JobLogs {
            job_id: Uuid::nil(),
            process_id: "p".into(),
            container_logs: vec!["x".into()],
            api_logs: vec![],
        };
        let value = serde_json::to_value(&logs).unwrap();
        assert!(value.get("jobID").is_some());
        assert!(value.get("processID").is_some());
        assert!(value.get("containerLogs").is_some());
        assert!(value.get("apiLogs").is_some());
    }
}
