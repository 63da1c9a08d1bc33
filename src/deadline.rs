//! Per-call deadlines for driver round trips.

use std::future::IntoFuture;
use std::time::Duration;

use crate::error::Result;

/// Point reads, writes, commands and cursor advances.
pub const SHORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Index builds, bulk runs and blob persistence.
pub const LONG_TIMEOUT: Duration = Duration::from_secs(30);

/// Await a driver call, failing with `MgoError::Timeout` once `limit` elapses.
pub(crate) async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: IntoFuture<Output = mongodb::error::Result<T>>,
{
    Ok(tokio::time::timeout(limit, fut).await??)
}
