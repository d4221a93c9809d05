//! Bounded worker pool for saga tasks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Result, SagaError};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Saga tasks allowed to run at once
    pub workers: usize,
    /// Jobs allowed to wait for a worker
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 32,
            queue_capacity: 256,
        }
    }
}

/// A bounded queue feeding at most `workers` concurrently running jobs.
///
/// Submission is two-phase: [`WorkerPool::try_reserve`] claims a queue slot
/// (or fails with [`SagaError::Overloaded`]) before the caller commits to any
/// work, and [`PoolSlot::submit`] hands the job over.
pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: Arc<Semaphore>,
    config: PoolConfig,
    dispatcher: JoinHandle<()>,
}

impl WorkerPool {
    /// Starts the dispatcher. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let workers = Arc::new(Semaphore::new(config.workers.max(1)));

        let semaphore = workers.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });
            }
        });

        Self {
            sender,
            workers,
            config,
            dispatcher,
        }
    }

    /// Claims a queue slot without blocking.
    pub fn try_reserve(&self) -> Result<PoolSlot<'_>> {
        match self.sender.try_reserve() {
            Ok(permit) => Ok(PoolSlot { permit }),
            Err(_) => {
                metrics::counter!("saga_pool_rejections_total").increment(1);
                Err(SagaError::Overloaded)
            }
        }
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Jobs currently running.
    pub fn running(&self) -> usize {
        self.config.workers.max(1) - self.workers.available_permits()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// A reserved queue slot. Dropping it releases the slot unused.
pub struct PoolSlot<'a> {
    permit: mpsc::Permit<'a, Job>,
}

impl PoolSlot<'_> {
    pub fn submit<F>(self, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.permit.send(Box::pin(job));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_jobs_run() {
        let pool = WorkerPool::new(PoolConfig::default());
        let done = Arc::new(Notify::new());
        let signal = done.clone();

        pool.try_reserve().unwrap().submit(async move {
            signal.notify_one();
        });
        done.notified().await;
    }

    #[tokio::test]
    async fn test_full_queue_is_overloaded() {
        let pool = WorkerPool::new(PoolConfig {
            workers: 1,
            queue_capacity: 1,
        });

        let first = pool.try_reserve().unwrap();
        assert!(matches!(pool.try_reserve(), Err(SagaError::Overloaded)));

        // Releasing an unused slot frees it again.
        drop(first);
        assert!(pool.try_reserve().is_ok());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(PoolConfig {
            workers: 2,
            queue_capacity: 16,
        });
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let gate = gate.clone();
            let finished = finished.clone();
            pool.try_reserve().unwrap().submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                gate.notified().await;
                running.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }

        while finished.load(Ordering::SeqCst) < 6 {
            gate.notify_waiters();
            tokio::task::yield_now().await;
        }
        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak {peak}");
    }
}
