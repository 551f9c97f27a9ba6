// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for process-api.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub http_addr: SocketAddr,
    /// Name of this server, used to label remote batch jobs.
    pub server_name: String,
    /// Record store URL (`sqlite:` or `postgres:`). `None` selects the bounded cache.
    pub database_url: Option<String>,
    /// Root directory for the local object store.
    pub storage_dir: PathBuf,
    /// S3 bucket for metadata and logs; overrides `storage_dir` when set.
    pub s3_bucket: Option<String>,
    /// CloudWatch log group holding batch job output.
    pub batch_log_group: String,
    /// Key prefix for job metadata documents.
    pub metadata_prefix: String,
    /// Key prefix for final job log bundles.
    pub logs_prefix: String,
    /// Bounded cache limits (used only without a database).
    pub cache: CacheSettings,
    /// How often remote batch jobs are polled.
    pub batch_poll_interval: Duration,
    /// Attempts made to fetch remote logs on close.
    pub log_fetch_attempts: u32,
    /// Base backoff between remote log fetch attempts.
    pub log_fetch_backoff: Duration,
    /// Timeout applied to every backend call except the container wait.
    pub backend_timeout: Duration,
    /// Grace period for shutdown.
    pub shutdown_grace: Duration,
    /// Pull the workload image when a local job is created.
    pub pull_image_on_create: bool,
}

/// Bounded cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Size budget in bytes.
    pub max_size_bytes: u64,
    /// Fraction of the budget the cache is trimmed down to.
    pub trim_fraction: f64,
    /// Interval between size checks.
    pub check_interval: Duration,
    /// Snapshot file written on shutdown and read on startup.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_size_bytes: 1024 * 1024 * 1024, // 1 GiB
            trim_fraction: 0.8,
            check_interval: Duration::from_secs(3600), // 1 hour
            snapshot_path: Some(PathBuf::from(".data/snapshot")),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("PROCESS_API_PORT")
            .unwrap_or_else(|_| "5050".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let http_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let server_name =
            std::env::var("PROCESS_API_SERVER_NAME").unwrap_or_else(|_| "process-api".to_string());

        let database_url = std::env::var("PROCESS_API_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        if let Some(url) = &database_url
            && !url.starts_with("sqlite:")
            && !url.starts_with("postgres:")
            && !url.starts_with("postgresql:")
        {
            return Err(ConfigError::InvalidValue {
                key: "PROCESS_API_DATABASE_URL",
                value: url.clone(),
            });
        }

        let storage_dir = PathBuf::from(
            std::env::var("PROCESS_API_STORAGE_DIR").unwrap_or_else(|_| ".data/storage".to_string()),
        );
        let s3_bucket = std::env::var("PROCESS_API_S3_BUCKET")
            .ok()
            .filter(|bucket| !bucket.trim().is_empty());
        let batch_log_group = std::env::var("PROCESS_API_BATCH_LOG_GROUP")
            .unwrap_or_else(|_| "/aws/batch/job".to_string());
        let metadata_prefix = std::env::var("PROCESS_API_METADATA_PREFIX")
            .unwrap_or_else(|_| "metadata".to_string());
        let logs_prefix =
            std::env::var("PROCESS_API_LOGS_PREFIX").unwrap_or_else(|_| "logs".to_string());

        let defaults = CacheSettings::default();
        let trim_fraction: f64 = parse_var("PROCESS_API_CACHE_TRIM_FRACTION", 0.8)?;
        if !(trim_fraction > 0.0 && trim_fraction < 0.95) {
            return Err(ConfigError::InvalidValue {
                key: "PROCESS_API_CACHE_TRIM_FRACTION",
                value: trim_fraction.to_string(),
            });
        }
        let cache = CacheSettings {
            max_size_bytes: parse_var("PROCESS_API_CACHE_MAX_BYTES", defaults.max_size_bytes)?,
            trim_fraction,
            check_interval: Duration::from_secs(parse_var(
                "PROCESS_API_CACHE_CHECK_INTERVAL_SECS",
                3600,
            )?),
            snapshot_path: match std::env::var("PROCESS_API_CACHE_SNAPSHOT_PATH") {
                Ok(path) if path.is_empty() => None,
                Ok(path) => Some(PathBuf::from(path)),
                Err(_) => defaults.snapshot_path,
            },
        };

        Ok(Self {
            http_addr,
            server_name,
            database_url,
            storage_dir,
            s3_bucket,
            batch_log_group,
            metadata_prefix,
            logs_prefix,
            cache,
            batch_poll_interval: Duration::from_secs(parse_var(
                "PROCESS_API_BATCH_POLL_INTERVAL_SECS",
                10,
            )?),
            log_fetch_attempts: parse_var("PROCESS_API_LOG_FETCH_ATTEMPTS", 5)?,
            log_fetch_backoff: Duration::from_secs(parse_var(
                "PROCESS_API_LOG_FETCH_BACKOFF_SECS",
                10,
            )?),
            backend_timeout: Duration::from_secs(parse_var("PROCESS_API_BACKEND_TIMEOUT_SECS", 30)?),
            shutdown_grace: Duration::from_secs(parse_var("PROCESS_API_SHUTDOWN_GRACE_SECS", 8)?),
            pull_image_on_create: std::env::var("PROCESS_API_PULL_IMAGE_ON_CREATE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// A variable holds a value that cannot be used.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Raw value found.
        value: String,
    },
}
