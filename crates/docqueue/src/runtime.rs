//! Wires every component from a [`Config`] and runs the background services.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info};

use crate::broadcast::JobProgressBroadcaster;
use crate::config::Config;
use crate::db::Database;
use crate::engine::AnalysisEngine;
use crate::error::Result;
use crate::maintenance::{PendingReconciler, PeriodicTask, RetentionSweeper};
use crate::queue::{Queue, SqliteQueue};
use crate::storage::{DocumentStorage, FileStorage};
use crate::store::JobStore;
use crate::submit::Submitter;
use crate::worker::{Executor, WorkerPool, DEFAULT_POLL_TIMEOUT};

/// All long-lived components, built but not yet running.
pub struct Runtime {
    config: Config,
    store: JobStore,
    queue: Arc<dyn Queue>,
    storage: Arc<dyn DocumentStorage>,
    progress: JobProgressBroadcaster,
    executor: Arc<Executor>,
    submitter: Submitter,
    sweeper: Arc<RetentionSweeper>,
    reconciler: Arc<PendingReconciler>,
}

impl Runtime {
    pub fn build(config: Config, engine: Arc<dyn AnalysisEngine>) -> Result<Self> {
        let store_db = Database::connect(&config.store.connection)?;
        let (queue_db, shared_database) = match config.broker.endpoint.as_deref() {
            Some(endpoint) if endpoint != config.store.connection => {
                info!("Using separate queue database at {}", endpoint);
                (Database::connect(endpoint)?, false)
            }
            _ => (store_db.clone(), true),
        };

        let store = JobStore::new(store_db);
        let queue: Arc<dyn Queue> = Arc::new(SqliteQueue::new(
            queue_db,
            config.broker.lease(),
            config.broker.poll_interval(),
        ));
        let storage: Arc<dyn DocumentStorage> =
            Arc::new(FileStorage::new(Path::new(&config.documents.directory)));
        let progress = JobProgressBroadcaster::default();

        let executor = Arc::new(Executor::new(
            store.clone(),
            Arc::clone(&queue),
            Arc::clone(&storage),
            engine,
            progress.clone(),
            config.workers.executor_settings(),
        ));
        let submitter = Submitter::new(store.clone(), Arc::clone(&queue), Arc::clone(&storage));
        let sweeper = Arc::new(RetentionSweeper::new(
            store.clone(),
            Arc::clone(&storage),
            config.retention.settings(),
        ));
        let reconciler = PendingReconciler::new(
            store.clone(),
            Arc::clone(&queue),
            config.reconcile.settings(),
        );
        let reconciler = Arc::new(if shared_database {
            reconciler.sharing_database()
        } else {
            reconciler
        });

        Ok(Self {
            config,
            store,
            queue,
            storage,
            progress,
            executor,
            submitter,
            sweeper,
            reconciler,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn storage(&self) -> &Arc<dyn DocumentStorage> {
        &self.storage
    }

    pub fn progress(&self) -> &JobProgressBroadcaster {
        &self.progress
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub fn sweeper(&self) -> &RetentionSweeper {
        &self.sweeper
    }

    pub fn reconciler(&self) -> &PendingReconciler {
        &self.reconciler
    }

    /// Starts the worker pool, the retention sweeper and the pending
    /// reconciler.
    pub fn start(&self) -> Result<Services> {
        let pool = WorkerPool::start(
            Arc::clone(&self.executor),
            Arc::clone(&self.queue),
            self.config.workers.count,
            DEFAULT_POLL_TIMEOUT,
        )?;

        let sweep = PeriodicTask::new(self.config.retention.interval());
        let sweep_handle = match sweep.start(Arc::clone(&self.sweeper)) {
            Ok(handle) => handle,
            Err(e) => {
                pool.shutdown();
                pool.wait();
                return Err(e.into());
            }
        };

        let reconcile = PeriodicTask::new(self.config.reconcile.interval());
        let reconcile_handle = match reconcile.start(Arc::clone(&self.reconciler)) {
            Ok(handle) => handle,
            Err(e) => {
                sweep.stop();
                let _ = sweep_handle.join();
                pool.shutdown();
                pool.wait();
                return Err(e.into());
            }
        };

        info!(
            "docqueue running: {} workers, retention {}s, reconcile every {}s",
            pool.worker_count(),
            self.config.retention.window_secs,
            self.config.reconcile.interval_secs
        );

        Ok(Services {
            pool,
            sweep,
            reconcile,
            handles: vec![sweep_handle, reconcile_handle],
        })
    }
}

/// Handles to the running background services.
pub struct Services {
    pool: WorkerPool,
    sweep: PeriodicTask,
    reconcile: PeriodicTask,
    handles: Vec<JoinHandle<()>>,
}

impl Services {
    /// Runs a retention sweep now.
    pub fn trigger_sweep(&self) {
        self.sweep.trigger();
    }

    /// Runs a pending reconciliation now.
    pub fn trigger_reconcile(&self) {
        self.reconcile.trigger();
    }

    pub fn worker_count(&self) -> usize {
        self.pool.worker_count()
    }

    /// Stops every service and waits for in-flight jobs to finish.
    pub fn shutdown(self) {
        self.sweep.stop();
        self.reconcile.stop();
        self.pool.shutdown();
        self.pool.wait();

        for handle in self.handles {
            if let Err(e) = handle.join() {
                error!("Maintenance thread panicked: {:?}", e);
            }
        }
        info!("docqueue stopped");
    }
}
