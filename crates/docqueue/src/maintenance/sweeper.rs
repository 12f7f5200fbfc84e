//! Retention sweeper: purges finished jobs once they age out.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use super::scheduler::MaintenanceTask;
use crate::db::DatabaseError;
use crate::error::DocqueueError;
use crate::job::Job;
use crate::storage::{DeleteOutcome, DocumentStorage};
use crate::store::{JobStore, ScanPage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSettings {
    /// How long a terminal job is kept after `completed_at`.
    pub window: Duration,
    /// Jobs purged per sweep, and the page size of every scan. Jobs that
    /// cannot be purged are paged past and do not count.
    pub batch_size: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * 24 * 60 * 60),
            batch_size: 500,
        }
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: usize,
    pub purged: usize,
    pub failed: usize,
}

pub struct RetentionSweeper {
    store: JobStore,
    storage: Arc<dyn DocumentStorage>,
    settings: RetentionSettings,
}

impl RetentionSweeper {
    pub fn new(
        store: JobStore,
        storage: Arc<dyn DocumentStorage>,
        settings: RetentionSettings,
    ) -> Self {
        Self {
            store,
            storage,
            settings,
        }
    }

    pub fn sweep(&self) -> Result<SweepReport, DatabaseError> {
        self.sweep_at(Utc::now())
    }

    /// Purges terminal jobs whose `completed_at` is strictly older than
    /// `now - window`. A failure on one job never stops the others.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, DatabaseError> {
        let _span = info_span!("sweep_cycle").entered();

        let Some(cutoff) = chrono::Duration::from_std(self.settings.window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
        else {
            return Ok(SweepReport::default());
        };

        self.purge_pages(self.settings.batch_size, |limit, offset| {
            self.store.expired_terminal(cutoff, limit, offset)
        })
    }

    /// Purges every failed job regardless of age.
    pub fn purge_failed(&self) -> Result<SweepReport, DatabaseError> {
        let _span = info_span!("purge_failed").entered();
        let report = self.purge_pages(u64::MAX, |limit, offset| {
            self.store.failed_jobs(limit, offset)
        })?;
        info!(
            "Purged {} failed jobs, {} could not be removed",
            report.purged, report.failed
        );
        Ok(report)
    }

    /// Purges jobs from `fetch` until `budget` are gone or the scan runs
    /// dry. Jobs that fail to purge stay in the table, so the offset moves
    /// past them.
    fn purge_pages<F>(&self, budget: u64, mut fetch: F) -> Result<SweepReport, DatabaseError>
    where
        F: FnMut(u64, u64) -> Result<ScanPage, DatabaseError>,
    {
        let page_size = self.settings.batch_size.max(1);
        let mut report = SweepReport::default();
        let mut offset = 0u64;

        while (report.purged as u64) < budget {
            let limit = (budget - report.purged as u64).min(page_size);
            let page = fetch(limit, offset)?;
            if page.rows() == 0 {
                break;
            }
            offset += page.unreadable;
            report.examined += page.jobs.len();

            for job in &page.jobs {
                match self.purge(job) {
                    Ok(true) => report.purged += 1,
                    Ok(false) => debug!("Job {} vanished before it was purged", job.id),
                    Err(e) => {
                        warn!("Keeping job {} for the next sweep: {}", job.id, e);
                        report.failed += 1;
                        offset += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Deletes the document, then the job's records.
    fn purge(&self, job: &Job) -> Result<bool, DocqueueError> {
        match self.storage.delete(&job.input.document)? {
            DeleteOutcome::Deleted => {}
            DeleteOutcome::NotFound => {
                debug!("Document for job {} was already gone", job.id)
            }
        }
        Ok(self.store.delete(&job.id)?)
    }
}

impl MaintenanceTask for RetentionSweeper {
    fn name(&self) -> &'static str {
        "retention-sweep"
    }

    fn run_once(&self) {
        match self.sweep() {
            Ok(report) if report.purged > 0 || report.failed > 0 => info!(
                "Retention sweep: {} purged, {} failed of {} expired",
                report.purged, report.failed, report.examined
            ),
            Ok(_) => debug!("Retention sweep: nothing expired"),
            Err(e) => error!("Retention sweep failed: {}", e),
        }
    }
}
