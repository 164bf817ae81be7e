use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::caching::CacheError;

/// A bounded pool for the expensive part of cache populations.
///
/// Permits are only held around blocking work and subprocess waits, never while awaiting another
/// cache. A population that depends on a different cache therefore cannot starve the pool.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs a blocking closure on the blocking thread pool once a permit is available.
    pub async fn spawn_blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self.acquire().await?;
        tokio::task::spawn_blocking(f)
            .await
            .map_err(CacheError::from_std_error)
    }

    /// Polls `future` to completion while holding a permit.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output, CacheError> {
        let _permit = self.acquire().await?;
        Ok(future.await)
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>, CacheError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| CacheError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..8).map(|_| {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                pool.spawn_blocking(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
