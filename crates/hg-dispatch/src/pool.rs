//! WorkerPool - bounded executor for background tasks
//!
//! - Semaphore-based concurrency control
//! - Admission capped at `queue_capacity` tasks (waiting + running)
//! - Drain stops admission and waits for in-flight work

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use hg_common::HookgateError;
use hg_config::DispatchConfig;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool is draining")]
    Draining,

    #[error("Pool at capacity ({capacity} tasks)")]
    AtCapacity { capacity: u32 },
}

impl From<PoolError> for HookgateError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Draining => HookgateError::ShutdownInProgress,
            PoolError::AtCapacity { .. } => HookgateError::transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub completed: u64,
    pub running: bool,
}

pub struct WorkerPool {
    concurrency: u32,
    queue_capacity: u32,

    semaphore: Arc<Semaphore>,

    /// Admitted and not yet finished
    admitted: Arc<AtomicU32>,

    /// Holding a permit
    active_workers: Arc<AtomicU32>,

    completed: Arc<AtomicU64>,

    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(concurrency: u32, queue_capacity: u32) -> Self {
        let concurrency = concurrency.max(1);
        let queue_capacity = queue_capacity.max(concurrency);

        info!(concurrency, queue_capacity, "Starting worker pool");

        Self {
            concurrency,
            queue_capacity,
            semaphore: Arc::new(Semaphore::new(concurrency as usize)),
            admitted: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            running: AtomicBool::new(true),
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.concurrency, config.queue_capacity)
    }

    /// Admit a task. The future is dropped unrun when admission fails.
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(PoolError::Draining);
        }

        let capacity = self.queue_capacity;
        if self
            .admitted
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_err()
        {
            debug!(capacity, "Pool at capacity, rejecting");
            return Err(PoolError::AtCapacity { capacity });
        }

        let semaphore = self.semaphore.clone();
        let admitted = self.admitted.clone();
        let active_workers = self.active_workers.clone();
        let completed = self.completed.clone();

        tokio::spawn(async move {
            match semaphore.acquire_owned().await {
                Ok(permit) => {
                    active_workers.fetch_add(1, Ordering::SeqCst);
                    task.await;
                    active_workers.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);
                    drop(permit);
                }
                Err(_) => warn!("Semaphore closed, dropping task"),
            }
            admitted.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(())
    }

    /// Stop admitting work and wait up to `grace` for in-flight tasks.
    /// Returns true when fully drained.
    pub async fn drain(&self, grace: Duration) -> bool {
        info!(
            in_flight = self.admitted.load(Ordering::SeqCst),
            grace_secs = grace.as_secs(),
            "Draining worker pool"
        );
        self.running.store(false, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + grace;
        while !self.is_fully_drained() {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.admitted.load(Ordering::SeqCst),
                    "Drain grace period elapsed with tasks still running"
                );
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        info!("Worker pool drained");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_fully_drained(&self) -> bool {
        self.admitted.load(Ordering::SeqCst) == 0
    }

    pub fn available_capacity(&self) -> u32 {
        self.queue_capacity
            .saturating_sub(self.admitted.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> PoolStats {
        let admitted = self.admitted.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);
        PoolStats {
            concurrency: self.concurrency,
            active_workers: active,
            queue_size: admitted.saturating_sub(active),
            queue_capacity: self.queue_capacity,
            completed: self.completed.load(Ordering::SeqCst),
            running: self.is_running(),
        }
    }
}
