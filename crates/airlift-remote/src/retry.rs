//! Fixed-backoff retry for transient remote failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Back-off between connection attempts while an instance is still
/// coming up.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(4);

/// Retry `attempt` indefinitely while `transient` says the error is
/// recoverable, sleeping `backoff` between tries. Used by executor
/// implementations for their connect loops.
pub async fn retry_transient<T, E, F, Fut>(
    backoff: Duration,
    transient: impl Fn(&E) -> bool,
    mut attempt: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if transient(&err) => {
                warn!(error = %err, "transient remote failure, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
