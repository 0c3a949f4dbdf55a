//! Caller-side deadlines
//!
//! Nothing in the bus or the bridge times out on its own. Callers that need a
//! bound race the operation against a timer with these helpers.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Default bound used by tests and tools when racing a bridge operation
pub const DEFAULT_BRIDGE_DEADLINE: Duration = Duration::from_secs(3);

/// The operation did not finish in time
#[derive(Debug, Error)]
#[error("time limit of {limit:?} exceeded")]
pub struct DeadlineExceeded {
    pub limit: Duration,
}

/// Run `operation`, giving up after `limit`
pub async fn with_deadline<F, T>(operation: F, limit: Duration) -> Result<T, DeadlineExceeded>
where
    F: Future<Output = T>,
{
    timeout(limit, operation)
        .await
        .map_err(|_| DeadlineExceeded { limit })
}

/// Run a fallible `operation` under a deadline, flattening both failure kinds
pub async fn limit_time<F, T, E>(operation: F, limit: Duration) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    Ok(with_deadline(operation, limit).await??)
}
