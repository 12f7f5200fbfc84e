//! Submission path: store the document, record the job, enqueue it.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;

use crate::error::SubmitError;
use crate::job::{JobId, JobInput};
use crate::queue::Queue;
use crate::storage::DocumentStorage;
use crate::store::JobStore;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub document_name: String,
    pub content: Vec<u8>,
    pub query: String,
    /// History category, `general` when absent.
    pub category: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: JobId,
    /// False when the job was recorded but the enqueue failed. The pending
    /// reconciler enqueues it later.
    pub queued: bool,
}

#[derive(Clone)]
pub struct Submitter {
    store: JobStore,
    queue: Arc<dyn Queue>,
    storage: Arc<dyn DocumentStorage>,
}

impl Submitter {
    pub fn new(store: JobStore, queue: Arc<dyn Queue>, storage: Arc<dyn DocumentStorage>) -> Self {
        Self {
            store,
            queue,
            storage,
        }
    }

    pub fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        validate(&request)?;

        let document = self.storage.put(&request.document_name, &request.content)?;

        let input = JobInput {
            document: document.clone(),
            query: request.query,
        };
        let category = request.category.as_deref().unwrap_or_default();
        let job = match self
            .store
            .create(input, category, request.content.len() as u64)
        {
            Ok(job) => job,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&document) {
                    warn!(
                        "Failed to remove document '{}' after job creation failed: {}",
                        document.key, cleanup
                    );
                }
                return Err(e.into());
            }
        };

        let queued = match self.queue.enqueue(&job.id) {
            Ok(message_id) => {
                debug!("Job {} enqueued as {}", job.id, message_id);
                true
            }
            Err(e) => {
                warn!("Job {} recorded but not enqueued: {}", job.id, e);
                false
            }
        };

        info!(
            "Submitted job {} for '{}' ({} bytes)",
            job.id,
            document.name,
            request.content.len()
        );

        Ok(SubmitReceipt {
            job_id: job.id,
            queued,
        })
    }
}

fn validate(request: &SubmitRequest) -> Result<(), SubmitError> {
    if request.document_name.trim().is_empty() {
        return Err(SubmitError::Validation(
            "document name must not be empty".to_string(),
        ));
    }
    if request.content.is_empty() {
        return Err(SubmitError::Validation(
            "document content must not be empty".to_string(),
        ));
    }
    if request.query.trim().is_empty() {
        return Err(SubmitError::Validation("query must not be blank".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::error::{QueueError, StorageError};
    use crate::job::{DocumentRef, JobStateKind};
    use crate::queue::{AckOutcome, Lease, MessageId, QueueDepth, SqliteQueue};
    use crate::storage::{DeleteOutcome, FileStorage};
    use std::time::Duration;
    use tempfile::TempDir;

    struct DownQueue;

    impl Queue for DownQueue {
        fn enqueue(&self, _job_id: &JobId) -> Result<MessageId, QueueError> {
            Err(QueueError::CorruptMessage {
                message_id: "-".to_string(),
                reason: "broker unavailable".to_string(),
            })
        }

        fn dequeue(&self, _timeout: Duration) -> Result<Option<Lease>, QueueError> {
            Ok(None)
        }

        fn ack(&self, _token: &str) -> Result<AckOutcome, QueueError> {
            Ok(AckOutcome::LeaseLost)
        }

        fn extend_lease(&self, _token: &str) -> Result<bool, QueueError> {
            Ok(false)
        }

        fn lease_active(&self, _token: &str) -> Result<bool, QueueError> {
            Ok(false)
        }

        fn contains_job(&self, _job_id: &JobId) -> Result<bool, QueueError> {
            Ok(false)
        }

        fn depth(&self) -> Result<QueueDepth, QueueError> {
            Ok(QueueDepth::default())
        }

        fn lease_duration(&self) -> Duration {
            Duration::from_secs(30)
        }
    }

    struct FullDisk;

    impl DocumentStorage for FullDisk {
        fn put(&self, name: &str, _content: &[u8]) -> Result<DocumentRef, StorageError> {
            Err(StorageError::WriteFile {
                path: name.into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            })
        }

        fn read(&self, _document: &DocumentRef) -> Result<Vec<u8>, StorageError> {
            unreachable!()
        }

        fn delete(&self, _document: &DocumentRef) -> Result<DeleteOutcome, StorageError> {
            Ok(DeleteOutcome::NotFound)
        }
    }

    fn request(name: &str, content: &[u8], query: &str) -> SubmitRequest {
        SubmitRequest {
            document_name: name.to_string(),
            content: content.to_vec(),
            query: query.to_string(),
            category: None,
        }
    }

    fn sqlite_queue(db: &Database) -> Arc<dyn Queue> {
        Arc::new(SqliteQueue::new(
            db.clone(),
            Duration::from_secs(30),
            Duration::from_millis(10),
        ))
    }

    #[test]
    fn test_submit_records_and_enqueues() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let queue = sqlite_queue(&db);
        let submitter = Submitter::new(
            store.clone(),
            Arc::clone(&queue),
            Arc::new(FileStorage::new(dir.path())),
        );

        let mut req = request("report.pdf", b"%PDF-1.4", "summarize");
        req.category = Some("invoices".to_string());
        let receipt = submitter.submit(req).unwrap();

        assert!(receipt.queued);
        assert!(queue.contains_job(&receipt.job_id).unwrap());
        let job = store.get(&receipt.job_id).unwrap().unwrap();
        assert_eq!(job.state.kind(), JobStateKind::Pending);
        let history = store.history(&receipt.job_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].category, "invoices");
        assert_eq!(history[0].document_size, 8);
        assert_eq!(history[0].document_type.as_deref(), Some("application/pdf"));
    }

    #[test]
    fn test_validation_rejects_before_storing() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let submitter = Submitter::new(
            store.clone(),
            sqlite_queue(&db),
            Arc::new(FileStorage::new(dir.path())),
        );

        for bad in [
            request("", b"x", "q"),
            request("a.txt", b"", "q"),
            request("a.txt", b"x", "   "),
        ] {
            assert!(matches!(
                submitter.submit(bad),
                Err(SubmitError::Validation(_))
            ));
        }
        assert_eq!(store.stats().unwrap().total_jobs, 0);
    }

    #[test]
    fn test_storage_failure_creates_no_job() {
        let db = Database::open_in_memory().unwrap();
        let store = JobStore::new(db.clone());
        let submitter = Submitter::new(store.clone(), sqlite_queue(&db), Arc::new(FullDisk));

        let result = submitter.submit(request("a.txt", b"x", "q"));
        assert!(matches!(result, Err(SubmitError::Infrastructure(_))));
        assert_eq!(store.stats().unwrap().total_jobs, 0);
    }

    #[test]
    fn test_enqueue_failure_still_records_job() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(Database::open_in_memory().unwrap());
        let submitter = Submitter::new(
            store.clone(),
            Arc::new(DownQueue),
            Arc::new(FileStorage::new(dir.path())),
        );

        let receipt = submitter.submit(request("a.txt", b"x", "q")).unwrap();
        assert!(!receipt.queued);
        assert_eq!(
            store.get(&receipt.job_id).unwrap().unwrap().state.kind(),
            JobStateKind::Pending
        );
    }
}
