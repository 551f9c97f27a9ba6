// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend clients - container runtime and batch service.

#[cfg(feature = "aws")]
pub mod aws_batch;
pub mod docker;
pub mod mock;
mod traits;

use std::future::Future;
use std::time::Duration;

pub use docker::DockerBackend;
pub use mock::{MockBatchBackend, MockContainerBackend};
pub use traits::*;

/// Run a backend call with a deadline.
pub async fn with_timeout<T>(
    limit: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::Timeout {
            operation,
            after: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout(Duration::from_secs(1), "ping", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_elapses() {
        let err = with_timeout(Duration::from_millis(50), "describe", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            BackendError::Timeout {
                operation: "describe",
                ..
            }
        ));
    }
}
