// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! AWS Batch backend with CloudWatch Logs retrieval.

use std::fmt::Debug;

use async_trait::async_trait;
use aws_sdk_batch::error::{DisplayErrorContext, SdkError};
use aws_sdk_batch::types::{ContainerOverrides, KeyValuePair, ResourceType};
use chrono::{DateTime, Utc};
use tracing::debug;

use super::traits::*;

/// Default CloudWatch log group for Batch jobs.
pub const DEFAULT_LOG_GROUP: &str = "/aws/batch/job";

/// SDK accessors return `T` for required members and `Option<T>` otherwise.
trait Present<T> {
    fn present(self) -> Option<T>;
}

impl<T> Present<T> for T {
    fn present(self) -> Option<T> {
        Some(self)
    }
}

impl<T> Present<T> for Option<T> {
    fn present(self) -> Option<T> {
        self
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> BackendError
where
    E: std::error::Error + 'static,
    R: Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
            BackendError::Unavailable(message)
        }
        SdkError::ServiceError(_) => BackendError::Rejected(message),
        _ => BackendError::Api(message),
    }
}

fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis
        .filter(|m| *m > 0)
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// AWS Batch + CloudWatch Logs client.
pub struct AwsBatchBackend {
    batch: aws_sdk_batch::Client,
    logs: aws_sdk_cloudwatchlogs::Client,
    log_group: String,
}

impl AwsBatchBackend {
    /// Build clients from existing SDK configuration.
    pub fn new(config: &aws_config::SdkConfig, log_group: impl Into<String>) -> Self {
        Self {
            batch: aws_sdk_batch::Client::new(config),
            logs: aws_sdk_cloudwatchlogs::Client::new(config),
            log_group: log_group.into(),
        }
    }

    /// Load credentials and region from the standard AWS environment.
    pub async fn from_env(log_group: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(&config, log_group)
    }
}

#[async_trait]
impl BatchBackend for AwsBatchBackend {
    fn backend_type(&self) -> &'static str {
        "aws-batch"
    }

    async fn submit_job(&self, submission: &BatchSubmission) -> Result<String> {
        let environment = submission
            .env
            .iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect();
        let overrides = ContainerOverrides::builder()
            .set_command(Some(submission.command.clone()))
            .set_environment(Some(environment))
            .build();

        let output = self
            .batch
            .submit_job()
            .job_name(&submission.name)
            .job_queue(&submission.job_queue)
            .job_definition(&submission.job_definition)
            .container_overrides(overrides)
            .send()
            .await
            .map_err(classify)?;

        let job_id: Option<&str> = output.job_id().present();
        job_id
            .map(str::to_string)
            .ok_or_else(|| BackendError::Api("submit response carried no job id".to_string()))
    }

    async fn describe_job(&self, batch_id: &str) -> Result<BatchJobDescription> {
        let output = self
            .batch
            .describe_jobs()
            .jobs(batch_id)
            .send()
            .await
            .map_err(classify)?;

        let detail = output
            .jobs()
            .first()
            .ok_or_else(|| BackendError::NotFound(batch_id.to_string()))?;

        let status: Option<&aws_sdk_batch::types::JobStatus> = detail.status().present();
        let created: Option<i64> = detail.created_at().present();
        let started: Option<i64> = detail.started_at().present();
        let stopped: Option<i64> = detail.stopped_at().present();

        Ok(BatchJobDescription {
            status: status.map(|s| s.as_str().to_string()).unwrap_or_default(),
            status_reason: detail.status_reason().map(str::to_string),
            log_stream: detail
                .container()
                .and_then(|c| c.log_stream_name())
                .map(str::to_string),
            times: ExecutionTimes {
                created: from_millis(created),
                started: from_millis(started),
                ended: from_millis(stopped),
            },
        })
    }

    async fn cancel_job(&self, batch_id: &str, reason: &str) -> Result<()> {
        self.batch
            .cancel_job()
            .job_id(batch_id)
            .reason(reason)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn terminate_job(&self, batch_id: &str, reason: &str) -> Result<()> {
        self.batch
            .terminate_job()
            .job_id(batch_id)
            .reason(reason)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn describe_job_definition(&self, job_definition: &str) -> Result<JobDefinitionInfo> {
        let output = self
            .batch
            .describe_job_definitions()
            .job_definitions(job_definition)
            .send()
            .await
            .map_err(classify)?;

        let definition = output
            .job_definitions()
            .first()
            .ok_or_else(|| BackendError::NotFound(job_definition.to_string()))?;
        let Some(container) = definition.container_properties() else {
            return Err(BackendError::Api(format!(
                "job definition {job_definition} has no container properties"
            )));
        };

        let mut info = JobDefinitionInfo {
            image: container.image().unwrap_or_default().to_string(),
            ..Default::default()
        };
        for requirement in container.resource_requirements() {
            let value = requirement.value().unwrap_or_default();
            match requirement.r#type() {
                Some(ResourceType::Vcpu) => info.vcpus = value.parse().ok(),
                Some(ResourceType::Memory) => info.memory_mb = value.parse().ok(),
                _ => {}
            }
        }
        Ok(info)
    }

    async fn log_events(&self, log_stream: &str) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .logs
                .get_log_events()
                .log_group_name(&self.log_group)
                .log_stream_name(log_stream)
                .start_from_head(true)
                .set_next_token(token.clone())
                .send()
                .await
                .map_err(|err| {
                    let missing = err
                        .as_service_error()
                        .is_some_and(|e| e.is_resource_not_found_exception());
                    if missing {
                        BackendError::NotFound(log_stream.to_string())
                    } else {
                        classify(err)
                    }
                })?;

            let events = output.events();
            lines.extend(
                events
                    .iter()
                    .filter_map(|event| event.message())
                    .map(str::to_string),
            );

            let next = output.next_forward_token().map(str::to_string);
            // The forward token repeats once the end of the stream is reached.
            if events.is_empty() || next.is_none() || next == token {
                break;
            }
            token = next;
        }

        debug!(log_stream = %log_stream, lines = lines.len(), "Fetched batch logs");
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_present_accepts_both_shapes() {
        let required: Option<i64> = 5_i64.present();
        let optional: Option<i64> = Some(5_i64).present();
        assert_eq!(required, optional);
    }

    #[test]
    fn test_from_millis_ignores_zero() {
        assert!(from_millis(Some(0)).is_none());
        assert_eq!(
            from_millis(Some(1_714_557_600_000)).unwrap().timestamp(),
            1_714_557_600
        );
    }
}
