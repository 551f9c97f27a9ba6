// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object storage for job metadata and log bundles.
//!
//! | Store | Notes |
//! |-------|-------|
//! | [`LocalObjectStore`] | Files under a root directory |
//! | `S3ObjectStore` | S3 bucket (feature `aws`) |

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors from object storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The key would escape the store or is empty.
    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored object is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Remote storage call failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Key/value blob storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store type identifier (e.g., "local", "s3").
    fn store_type(&self) -> &'static str;

    /// Write `bytes` under `key`, replacing any existing object.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        expires_in: Option<Duration>,
    ) -> Result<()>;

    /// Whether an object exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read the object under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read and parse the JSON object under `key`.
    async fn get_json(&self, key: &str) -> Result<Option<Value>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Object store backed by a local directory.
///
/// Expiry is not enforced.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Store objects under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn store_type(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
        _expires_in: Option<Duration>,
    ) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(key = %key, content_type = %content_type, "Stored object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)?).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)?).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(feature = "aws")]
pub use s3::S3ObjectStore;

#[cfg(feature = "aws")]
mod s3 {
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use aws_sdk_s3::primitives::{ByteStream, DateTime};

    use super::{ObjectStore, Result, StorageError};

    /// Object store backed by an S3 bucket.
    pub struct S3ObjectStore {
        client: aws_sdk_s3::Client,
        bucket: String,
    }

    impl S3ObjectStore {
        /// Store objects in `bucket`.
        pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
            Self {
                client,
                bucket: bucket.into(),
            }
        }

        /// Load credentials and region from the standard AWS environment.
        pub async fn from_env(bucket: impl Into<String>) -> Self {
            let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            Self::new(aws_sdk_s3::Client::new(&config), bucket)
        }
    }

    #[async_trait]
    impl ObjectStore for S3ObjectStore {
        fn store_type(&self) -> &'static str {
            "s3"
        }

        async fn put(
            &self,
            key: &str,
            bytes: Vec<u8>,
            content_type: &str,
            expires_in: Option<Duration>,
        ) -> Result<()> {
            let expires = expires_in.map(|ttl| DateTime::from(SystemTime::now() + ttl));
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(bytes))
                .content_type(content_type)
                .set_expires(expires)
                .send()
                .await
                .map_err(|e| {
                    StorageError::Backend(format!(
                        "failed to write s3://{}/{key}: {e}",
                        self.bucket
                    ))
                })?;
            Ok(())
        }

        async fn exists(&self, key: &str) -> Result<bool> {
            match self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(_) => Ok(true),
                Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => Ok(false),
                Err(e) => Err(StorageError::Backend(format!(
                    "failed to inspect s3://{}/{key}: {e}",
                    self.bucket
                ))),
            }
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            let response = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                    return Ok(None);
                }
                Err(e) => {
                    return Err(StorageError::Backend(format!(
                        "failed to read s3://{}/{key}: {e}",
                        self.bucket
                    )));
                }
            };
            let data = response
                .body
                .collect()
                .await
                .map_err(|e| StorageError::Backend(format!("failed to read object body: {e}")))?
                .into_bytes()
                .to_vec();
            Ok(Some(data))
        }
    }
}
