// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! process-api - Asynchronous Process Execution Server
//!
//! An HTTP server responsible for:
//! - Job submission to local containers or AWS Batch
//! - Status callbacks and job lifecycle tracking
//! - Job history, logs and results

use std::sync::Arc;

use tracing::{info, warn};

use process_api::backend::DockerBackend;
use process_api::cache::BoundedJobCache;
use process_api::config::Config;
use process_api::runtime::{ProcessRuntime, ProcessRuntimeBuilder};
use process_api::storage::{LocalObjectStore, ObjectStore};
use process_api::store::{JobRecordStore, PostgresJobStore, SqliteJobStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "process_api=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        http_addr = %config.http_addr,
        server_name = %config.server_name,
        "Starting process-api"
    );

    let mut builder = ProcessRuntimeBuilder::from_config(&config);

    // Record store
    builder = match config.database_url.as_deref() {
        Some(url) if url.starts_with("sqlite:") => {
            let store: Arc<dyn JobRecordStore> = Arc::new(SqliteJobStore::connect(url).await?);
            info!("Connected to SQLite job store");
            builder.store(store)
        }
        Some(url) => {
            let store: Arc<dyn JobRecordStore> = Arc::new(PostgresJobStore::connect(url).await?);
            info!("Connected to PostgreSQL job store");
            builder.store(store)
        }
        None => builder.cache(Arc::new(BoundedJobCache::load(config.cache.clone()).await?)),
    };

    // Backends
    let docker = DockerBackend::connect_local()?;
    builder = builder.container_backend(Arc::new(docker));

    #[cfg(feature = "aws")]
    {
        use process_api::backend::aws_batch::AwsBatchBackend;
        let batch = AwsBatchBackend::from_env(config.batch_log_group.clone()).await;
        builder = builder.batch_backend(Arc::new(batch));
        info!(log_group = %config.batch_log_group, "AWS Batch backend enabled");
    }

    builder = builder.object_store(object_store(&config).await?);

    // Start the runtime
    let runtime: ProcessRuntime = builder.build()?.start().await?;

    info!(addr = ?runtime.local_addr(), "process-api ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("process-api shut down");

    Ok(())
}

async fn object_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    if let Some(bucket) = &config.s3_bucket {
        #[cfg(feature = "aws")]
        {
            use process_api::storage::S3ObjectStore;
            info!(bucket = %bucket, "Using S3 object storage");
            return Ok(Arc::new(S3ObjectStore::from_env(bucket.clone()).await));
        }
        #[cfg(not(feature = "aws"))]
        anyhow::bail!("PROCESS_API_S3_BUCKET={bucket} requires the `aws` feature");
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;
    info!(dir = %config.storage_dir.display(), "Using local object storage");
    Ok(Arc::new(LocalObjectStore::new(&config.storage_dir)))
}
