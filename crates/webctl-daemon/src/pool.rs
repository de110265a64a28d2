//! Semaphore-based worker pool for threaded dispatch.
//!
//! The [`WorkerPool`] runs submitted jobs with bounded concurrency. Jobs wait
//! in a FIFO queue; a single dispatcher acquires a permit for the job at the
//! head of the queue before spawning it, so jobs start in submission order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, info};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 10;

/// A unit of work queued on the pool.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the pending count when a job finishes or is dropped unrun.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Bounded pool of workers fed from a FIFO queue.
pub struct WorkerPool {
    queue: mpsc::UnboundedSender<(Job, PendingGuard)>,
    semaphore: Arc<Semaphore>,
    workers: usize,
    pending: Arc<Pending>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create a pool with `workers` concurrent slots, spawning its
    /// dispatcher on `runtime`. Zero selects [`DEFAULT_WORKERS`].
    pub fn new(workers: usize, runtime: &Handle) -> Self {
        let workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        let semaphore = Arc::new(Semaphore::new(workers));
        let (queue, rx) = mpsc::unbounded_channel();

        runtime.spawn(run_dispatcher(rx, Arc::clone(&semaphore), runtime.clone()));
        info!(workers, "WorkerPool created");

        Self {
            queue,
            semaphore,
            workers,
            pending: Arc::new(Pending {
                count: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a job. Fails once the pool is closed.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(Arc::clone(&self.pending));
        self.queue
            .send((Box::pin(job), guard))
            .map_err(|_| PoolError::Closed)
    }

    /// Refuse further jobs. Queued and running jobs still complete.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("WorkerPool closed");
        }
    }

    /// Wait until every submitted job has finished.
    pub async fn drain(&self) {
        loop {
            let idle = self.pending.idle.notified();
            if self.pending.count.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Number of idle worker slots.
    pub fn available_workers(&self) -> usize {
        self.semaphore.available_permits()
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<(Job, PendingGuard)>,
    semaphore: Arc<Semaphore>,
    runtime: Handle,
) {
    while let Some((job, guard)) = rx.recv().await {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        runtime.spawn(async move {
            let _guard = guard;
            let _permit = permit;
            job.await;
        });
    }
    debug!("WorkerPool dispatcher stopped");
}

/// Errors from the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Worker pool has been closed")]
    Closed,
}
