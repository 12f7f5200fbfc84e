use std::sync::Mutex;

use chrono::Utc;

use crate::broadcast::JobProgressTracker;
use crate::job::{JobId, Progress};
use crate::store::JobStore;

/// Receives advisory progress from a running engine.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, percent: u8, message: &str);
}

/// No-op reporter for unit tests.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _percent: u8, _message: &str) {}
}

/// Persists progress on the job row and forwards it to broadcast
/// subscribers.
///
/// Writes are conditioned on the dispatch token, so a reporter left behind
/// by an abandoned engine thread cannot touch a job that moved on.
pub struct BroadcastProgress {
    store: JobStore,
    job_id: JobId,
    token: String,
    tracker: JobProgressTracker,
    last_percent: Mutex<Option<u8>>,
}

impl BroadcastProgress {
    pub fn new(store: JobStore, job_id: JobId, token: &str, tracker: JobProgressTracker) -> Self {
        Self {
            store,
            job_id,
            token: token.to_string(),
            tracker,
            last_percent: Mutex::new(None),
        }
    }
}

impl ProgressReporter for BroadcastProgress {
    fn report(&self, percent: u8, message: &str) {
        let percent = percent.min(100);
        if let Ok(mut last) = self.last_percent.lock() {
            if last.is_some_and(|prev| percent < prev) {
                log::debug!(
                    "Ignoring backwards progress {}% on job {}",
                    percent,
                    self.job_id
                );
                return;
            }
            *last = Some(percent);
        }

        let progress = Progress {
            percent,
            message: message.to_string(),
            updated_at: Utc::now(),
        };
        match self.store.update_progress(&self.job_id, &self.token, &progress) {
            Ok(true) => self.tracker.analyzing(percent, message),
            Ok(false) => log::debug!(
                "Dropped progress for job {}: no longer processing under this delivery",
                self.job_id
            ),
            Err(e) => log::warn!("Failed to record progress for job {}: {}", self.job_id, e),
        }
    }
}
