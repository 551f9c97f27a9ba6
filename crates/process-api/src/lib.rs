// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! process-api - Asynchronous Process Execution
//!
//! This crate runs OGC-style process jobs on a local container runtime or on
//! AWS Batch, tracks them through a small state machine and keeps a durable
//! history of every job.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                    HTTP clients / status agents                       │
//! └──────────────────────────────────────────────────────────────────────┘
//!                 │ submit / read / dismiss        │ PUT /jobs/{id}/status
//!                 ▼                                ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        process-api (This Crate)                       │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────────────────────┐  │
//! │  │  Handlers  │──►│  Registry  │◄──│       Status Pipeline        │  │
//! │  └─────┬──────┘   └────────────┘   │ (single consumer, closes     │  │
//! │        │ spawn run                 │  each job exactly once)      │  │
//! │        ▼                           └──────────────┬───────────────┘  │
//! │  ┌──────────────────────────┐                     │                  │
//! │  │ LocalContainerJob        │── job finished ────►│                  │
//! │  │ RemoteBatchJob (polls)   │                     │                  │
//! │  └──────────┬───────────────┘                     │                  │
//! └─────────────┼─────────────────────────────────────┼──────────────────┘
//!               ▼                                     ▼
//!     ┌───────────────────┐          ┌─────────────────────────────────┐
//!     │ Docker / AWS Batch│          │ Record store (SQLite, Postgres, │
//!     └───────────────────┘          │ bounded cache) + object storage │
//!                                    └─────────────────────────────────┘
//! ```
//!
//! # Job Status State Machine
//!
//! ```text
//!   ┌──────────┐      ┌─────────┐      ┌────────────┐
//!   │ accepted │─────►│ running │─────►│ successful │
//!   └────┬─────┘      └────┬────┘  │   └────────────┘
//!        │                 │       │   ┌────────────┐
//!        │                 │       └──►│   failed   │
//!        │      kill       │ kill      └────────────┘
//!        └────────┬────────┘           ┌────────────┐
//!                 └───────────────────►│ dismissed  │
//!                                      └────────────┘
//! ```
//!
//! Terminal statuses are final; later updates are ignored.
//!
//! # HTTP Routes
//!
//! | Route | Description |
//! |-------|-------------|
//! | `POST /jobs` | Submit a job |
//! | `GET /jobs` | List jobs (`limit`, `offset`, `processID`, `status`, `submitter`) |
//! | `GET /jobs/{jobID}` | Job status record |
//! | `GET /jobs/{jobID}/logs` | Container and API logs |
//! | `GET /jobs/{jobID}/results` | Results of a successful job |
//! | `DELETE /jobs/{jobID}` | Dismiss an active job |
//! | `PUT /jobs/{jobID}/status` | Status callback from a workload agent |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `PROCESS_API_PORT` | `5050` | HTTP port |
//! | `PROCESS_API_DATABASE_URL` | - | `sqlite:` or `postgres:` URL; unset selects the bounded cache |
//! | `PROCESS_API_STORAGE_DIR` | `.data/storage` | Local object storage root |
//! | `PROCESS_API_S3_BUCKET` | - | S3 object storage (feature `aws`) |
//! | `PROCESS_API_CACHE_MAX_BYTES` | 1 GiB | Bounded cache budget |
//! | `PROCESS_API_SHUTDOWN_GRACE_SECS` | `8` | Shutdown grace period |
//!
//! See [`Config`] for the full list.

#![deny(missing_docs)]

/// Container runtime and batch service clients.
pub mod backend;

/// Bounded in-memory job cache and its size monitor.
pub mod cache;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types for job orchestration.
pub mod error;

/// Transport-independent request handlers.
pub mod handlers;

/// Job variants, status state machine and logs.
pub mod job;

/// Provenance documents for successful jobs.
pub mod metadata;

/// Single-consumer status and completion pipeline.
pub mod pipeline;

/// Active job registry.
pub mod registry;

/// Embeddable runtime.
pub mod runtime;

/// HTTP server.
pub mod server;

/// Object storage for metadata and log bundles.
pub mod storage;

/// Durable job record store.
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::ProcessRuntime;
