//! Timeout and deadline helpers.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::HubError;

/// Wrap a future with a timeout.
pub async fn with_timeout<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, HubError>>,
) -> Result<T, HubError> {
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(HubError::Timeout(duration.as_millis() as u64)),
    }
}

/// Run a future until an absolute deadline.
///
/// The reported timeout is the budget the caller had when the call started,
/// so callers see the deadline they asked for rather than the residue.
pub async fn with_deadline<T>(
    deadline: Instant,
    future: impl Future<Output = Result<T, HubError>>,
) -> Result<T, HubError> {
    let budget = deadline.saturating_duration_since(Instant::now());
    match tokio::time::timeout_at(deadline, future).await {
        Ok(result) => result,
        Err(_) => Err(HubError::Timeout(budget.as_millis() as u64)),
    }
}
