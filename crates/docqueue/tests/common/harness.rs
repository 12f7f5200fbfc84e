//! Shared setup: a file-backed database, queue and document directory in a
//! temporary directory.

use std::sync::Arc;
use std::time::Duration;

use docqueue::broadcast::JobProgressBroadcaster;
use docqueue::db::Database;
use docqueue::engine::AnalysisEngine;
use docqueue::job::{Job, JobId, LifecycleController};
use docqueue::queue::{Lease, Queue, SqliteQueue};
use docqueue::storage::FileStorage;
use docqueue::store::JobStore;
use docqueue::submit::{SubmitRequest, Submitter};
use docqueue::worker::{Executor, ExecutorSettings};
use tempfile::TempDir;

pub struct TestHarness {
    pub dir: TempDir,
    pub store: JobStore,
    pub queue: Arc<SqliteQueue>,
    pub storage: Arc<FileStorage>,
    pub progress: JobProgressBroadcaster,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_lease(Duration::from_secs(30))
    }

    pub fn with_lease(lease: Duration) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let db = Database::open(&dir.path().join("docqueue.db")).expect("open database");
        let queue = Arc::new(SqliteQueue::new(
            db.clone(),
            lease,
            Duration::from_millis(10),
        ));
        let storage = Arc::new(FileStorage::new(dir.path().join("documents")));

        Self {
            store: JobStore::new(db),
            queue,
            storage,
            progress: JobProgressBroadcaster::default(),
            dir,
        }
    }

    pub fn executor(
        &self,
        engine: Arc<dyn AnalysisEngine>,
        settings: ExecutorSettings,
    ) -> Executor {
        Executor::new(
            self.store.clone(),
            self.queue.clone(),
            self.storage.clone(),
            engine,
            self.progress.clone(),
            settings,
        )
    }

    pub fn controller(&self) -> LifecycleController {
        LifecycleController::new(self.store.clone())
    }

    pub fn submitter(&self) -> Submitter {
        Submitter::new(self.store.clone(), self.queue.clone(), self.storage.clone())
    }

    /// Submits a text document and returns the job id.
    pub fn submit(&self, name: &str, content: &str, query: &str) -> JobId {
        let receipt = self
            .submitter()
            .submit(SubmitRequest {
                document_name: name.to_string(),
                content: content.as_bytes().to_vec(),
                query: query.to_string(),
                category: None,
            })
            .expect("submit");
        assert!(receipt.queued);
        receipt.job_id
    }

    /// Dequeues the next delivery, failing the test if none arrives.
    pub fn next_lease(&self) -> Lease {
        self.queue
            .dequeue(Duration::from_secs(5))
            .expect("dequeue")
            .expect("a delivery within 5s")
    }

    pub fn job(&self, id: &JobId) -> Job {
        self.store.get(id).expect("load job").expect("job exists")
    }
}

pub fn settings(soft: Duration, hard: Duration, max_deliveries: u32) -> ExecutorSettings {
    ExecutorSettings {
        limits: docqueue::worker::TimeLimits::new(soft, hard),
        max_deliveries,
    }
}
