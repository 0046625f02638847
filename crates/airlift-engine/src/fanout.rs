//! Bounded per-instance fan-out.
//!
//! Every phase (start, deploy, run, poll) executes one unit of work per
//! instance, concurrently, bounded by a fixed worker cap. One worker's
//! failure never cancels its siblings: each instance's result is recorded
//! independently and the call returns once all of them have finished.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use airlift_core::entity::InstanceId;

use crate::error::{EngineError, EngineResult};

/// Maximum concurrent per-instance workers.
pub const MAX_WORKERS: usize = 10;

/// Run `op` for every work item, at most [`MAX_WORKERS`] at a time.
///
/// Returns one `(instance, result)` pair per item, in completion order.
/// A worker panic is recorded as that instance's failure.
pub async fn fan_out<W, T, F, Fut>(
    work: Vec<(InstanceId, W)>,
    op: F,
) -> Vec<(InstanceId, EngineResult<T>)>
where
    W: Send + 'static,
    T: Send + 'static,
    F: Fn(InstanceId, W) -> Fut,
    Fut: Future<Output = EngineResult<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(MAX_WORKERS));
    let mut tasks = JoinSet::new();

    for (instance_id, item) in work {
        let semaphore = semaphore.clone();
        let fut = op(instance_id, item);
        tasks.spawn(async move {
            // Closed only on abort, which fan_out never does.
            let _permit = semaphore.acquire().await;
            (instance_id, fut.await)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((instance_id, result)) => results.push((instance_id, result)),
            Err(e) => {
                warn!(error = %e, "fan-out worker panicked");
                // The instance id is lost with the panic; surface the
                // failure under a sentinel id so callers still see it.
                results.push((usize::MAX, Err(EngineError::Worker(e.to_string()))));
            }
        }
    }
    results
}

/// Log failed branches and return the successful payloads.
pub fn successes<T>(results: Vec<(InstanceId, EngineResult<T>)>) -> Vec<(InstanceId, T)> {
    let mut ok = Vec::new();
    for (instance_id, result) in results {
        match result {
            Ok(value) => ok.push((instance_id, value)),
            Err(e) => warn!(instance = instance_id, error = %e, "instance branch failed"),
        }
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_every_item() {
        let work: Vec<(InstanceId, u32)> = (0..25).map(|i| (i, i as u32)).collect();
        let results = fan_out(work, |_, n| async move { Ok(n * 2) }).await;
        assert_eq!(results.len(), 25);
        let sum: u32 = results.iter().map(|(_, r)| *r.as_ref().unwrap()).sum();
        assert_eq!(sum, (0..25u32).map(|n| n * 2).sum::<u32>());
    }

    #[tokio::test]
    async fn one_failure_does_not_cancel_siblings() {
        let work: Vec<(InstanceId, ())> = (0..3).map(|i| (i, ())).collect();
        let results = fan_out(work, |id, ()| async move {
            if id == 1 {
                Err(EngineError::Worker("boom".to_string()))
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(id)
            }
        })
        .await;

        let ok = successes(results);
        assert_eq!(ok.len(), 2);
        assert!(ok.iter().all(|(id, _)| *id != 1));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        static ACTIVE: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        let work: Vec<(InstanceId, ())> = (0..40).map(|i| (i, ())).collect();
        let results = fan_out(work, |_, ()| async {
            let now = ACTIVE.fetch_add(1, Ordering::SeqCst) + 1;
            PEAK.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            ACTIVE.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

        assert_eq!(results.len(), 40);
        assert!(PEAK.load(Ordering::SeqCst) <= MAX_WORKERS);
    }
}
