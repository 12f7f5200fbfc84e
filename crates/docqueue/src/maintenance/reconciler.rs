//! Re-enqueues pending jobs whose queue message never made it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use super::scheduler::MaintenanceTask;
use crate::error::DocqueueError;
use crate::queue::Queue;
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Minimum age of a pending job before it is considered stuck.
    pub stuck_after: Duration,
    /// Jobs re-enqueued per cycle, and the page size of the scan.
    pub batch_size: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            stuck_after: Duration::from_secs(5 * 60),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub examined: usize,
    pub requeued: usize,
}

pub struct PendingReconciler {
    store: JobStore,
    queue: Arc<dyn Queue>,
    settings: ReconcileSettings,
    shared_database: bool,
}

impl PendingReconciler {
    pub fn new(store: JobStore, queue: Arc<dyn Queue>, settings: ReconcileSettings) -> Self {
        Self {
            store,
            queue,
            settings,
            shared_database: false,
        }
    }

    /// Declares that the queue table lives in the store's database, so
    /// queued jobs can be filtered out in the scan itself.
    pub fn sharing_database(mut self) -> Self {
        self.shared_database = true;
        self
    }

    pub fn reconcile(&self) -> Result<ReconcileReport, DocqueueError> {
        self.reconcile_at(Utc::now())
    }

    /// Enqueues every pending job older than `stuck_after` that has no
    /// message in the queue.
    pub fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport, DocqueueError> {
        let _span = info_span!("reconcile_cycle").entered();

        let Some(before) = chrono::Duration::from_std(self.settings.stuck_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(ReconcileReport::default());
        };

        let mut report = ReconcileReport::default();
        let mut offset = 0u64;
        let page_size = self.settings.batch_size.max(1);

        while (report.requeued as u64) < self.settings.batch_size {
            let limit = (self.settings.batch_size - report.requeued as u64).min(page_size);
            let page = if self.shared_database {
                self.store.orphaned_pending(before, limit, offset)?
            } else {
                self.store.stuck_pending(before, limit, offset)?
            };
            if page.rows() == 0 {
                break;
            }
            report.examined += page.jobs.len();

            // Rows that will still match the scan after this page.
            let mut remaining = page.unreadable;
            for job in &page.jobs {
                if self.queue.contains_job(&job.id)? {
                    remaining += 1;
                    continue;
                }
                match self.queue.enqueue(&job.id) {
                    Ok(message_id) => {
                        debug!("Re-enqueued pending job {} as {}", job.id, message_id);
                        report.requeued += 1;
                        if !self.shared_database {
                            remaining += 1;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to re-enqueue job {}: {}", job.id, e);
                        remaining += 1;
                    }
                }
            }
            offset += remaining;
        }

        Ok(report)
    }
}

impl MaintenanceTask for PendingReconciler {
    fn name(&self) -> &'static str {
        "pending-reconcile"
    }

    fn run_once(&self) {
        match self.reconcile() {
            Ok(report) if report.requeued > 0 => {
                info!("Re-enqueued {} stuck pending jobs", report.requeued)
            }
            Ok(_) => debug!("No stuck pending jobs"),
            Err(e) => error!("Pending reconcile failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::job::{DocumentRef, JobId, JobInput};
    use crate::queue::SqliteQueue;
    use chrono::TimeZone;

    fn t(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap()
    }

    fn pending_job(store: &JobStore, at: DateTime<Utc>) -> JobId {
        store
            .create_at(
                JobInput {
                    document: DocumentRef {
                        key: "k".to_string(),
                        name: "a.txt".to_string(),
                    },
                    query: "q".to_string(),
                },
                "",
                1,
                at,
            )
            .unwrap()
            .id
    }

    fn setup() -> (JobStore, Arc<SqliteQueue>) {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(SqliteQueue::new(
            db.clone(),
            Duration::from_secs(30),
            Duration::from_millis(10),
        ));
        (JobStore::new(db), queue)
    }

    #[test]
    fn test_requeues_only_orphaned_old_jobs() {
        let (store, queue) = setup();
        let orphan = pending_job(&store, t(0));
        let queued = pending_job(&store, t(0));
        let fresh = pending_job(&store, t(55));
        queue.enqueue(&queued).unwrap();

        let reconciler = PendingReconciler::new(
            store,
            queue.clone(),
            ReconcileSettings {
                stuck_after: Duration::from_secs(30),
                batch_size: 10,
            },
        );
        let report = reconciler.reconcile_at(t(59)).unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.requeued, 1);
        assert!(queue.contains_job(&orphan).unwrap());
        assert!(!queue.contains_job(&fresh).unwrap());
    }

    #[test]
    fn test_second_pass_is_noop() {
        let (store, queue) = setup();
        pending_job(&store, t(0));

        let reconciler = PendingReconciler::new(
            store,
            queue.clone(),
            ReconcileSettings {
                stuck_after: Duration::from_secs(1),
                batch_size: 10,
            },
        );
        assert_eq!(reconciler.reconcile_at(t(10)).unwrap().requeued, 1);
        assert_eq!(reconciler.reconcile_at(t(11)).unwrap().requeued, 0);
        assert_eq!(queue.depth().unwrap().ready, 1);
    }

    #[test]
    fn test_queued_backlog_does_not_hide_orphans() {
        for shared in [false, true] {
            let (store, queue) = setup();
            for _ in 0..5 {
                let queued = pending_job(&store, t(0));
                queue.enqueue(&queued).unwrap();
            }
            let orphan = pending_job(&store, t(1));

            let reconciler = PendingReconciler::new(
                store,
                queue.clone(),
                ReconcileSettings {
                    stuck_after: Duration::from_secs(30),
                    batch_size: 2,
                },
            );
            let reconciler = if shared {
                reconciler.sharing_database()
            } else {
                reconciler
            };

            let report = reconciler.reconcile_at(t(59)).unwrap();
            assert_eq!(report.requeued, 1, "shared database: {}", shared);
            assert!(queue.contains_job(&orphan).unwrap());
            assert_eq!(queue.depth().unwrap().ready, 6);
        }
    }
}
