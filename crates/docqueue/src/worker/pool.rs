use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use super::executor::Executor;
use crate::error::{SpawnError, WorkerError};
use crate::queue::Queue;

/// Default time a worker waits on an empty queue before re-checking for
/// shutdown.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Pause after an infrastructure error before the next dequeue.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Fixed set of worker threads pulling from one queue.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(
        executor: Arc<Executor>,
        queue: Arc<dyn Queue>,
        worker_count: usize,
        poll_timeout: Duration,
    ) -> Result<Self, WorkerError> {
        if worker_count == 0 {
            return Err(WorkerError::NoWorkers);
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let executor = Arc::clone(&executor);
            let queue = Arc::clone(&queue);
            let shutdown_flag = Arc::clone(&shutdown);

            let thread_name = format!("docqueue-worker-{}", worker_id);
            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    run_worker(worker_id, executor, queue, shutdown_flag, poll_timeout);
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Relaxed);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(SpawnError::new(thread_name, e).into());
                }
            }
        }

        info!("Started {} workers", worker_count);

        Ok(Self { workers, shutdown })
    }

    /// Asks workers to stop after their current job.
    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Blocks until every worker has exited.
    pub fn wait(self) {
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

fn run_worker(
    worker_id: usize,
    executor: Arc<Executor>,
    queue: Arc<dyn Queue>,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match queue.dequeue(poll_timeout) {
            Ok(Some(lease)) => {
                debug!("Worker {} handling job {}", worker_id, lease.job_id);
                match executor.handle(&lease) {
                    Ok(disposition) => {
                        debug!("Worker {} job {}: {:?}", worker_id, lease.job_id, disposition)
                    }
                    Err(e) => {
                        error!(
                            "Worker {} failed on job {}, leaving it for redelivery: {}",
                            worker_id, lease.job_id, e
                        );
                        thread::sleep(ERROR_BACKOFF);
                    }
                }
            }
            Ok(None) => continue,
            Err(e) => {
                error!("Worker {} failed to dequeue: {}", worker_id, e);
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
