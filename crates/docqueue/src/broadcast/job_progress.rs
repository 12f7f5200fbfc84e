//! Job progress broadcaster for real-time job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, JobStateKind};

/// Phase of job processing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Dispatched,
    Analyzing,
    Completed,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobPhase::Dispatched => write!(f, "Dispatched"),
            JobPhase::Analyzing => write!(f, "Analyzing"),
            JobPhase::Completed => write!(f, "Completed"),
            JobPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Progress event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub job_id: JobId,
    pub document_name: String,
    pub phase: JobPhase,
    /// Job state implied by the phase.
    pub state: JobStateKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    pub timestamp: DateTime<Utc>,
    /// Set on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobProgressEvent {
    pub fn new(job_id: JobId, document_name: &str, phase: JobPhase, message: &str) -> Self {
        let state = match phase {
            JobPhase::Completed => JobStateKind::Completed,
            JobPhase::Failed => JobStateKind::Failed,
            _ => JobStateKind::Processing,
        };

        Self {
            job_id,
            document_name: document_name.to_string(),
            phase,
            state,
            message: message.to_string(),
            percent: None,
            timestamp: Utc::now(),
            error: None,
        }
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }

    /// Creates a tracker for one job.
    pub fn track(&self, job_id: JobId, document_name: &str) -> JobProgressTracker {
        JobProgressTracker::new(job_id, document_name, Arc::clone(&self.sender))
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Tracks progress for a single job.
#[derive(Clone)]
pub struct JobProgressTracker {
    job_id: JobId,
    document_name: String,
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressTracker {
    pub fn new(
        job_id: JobId,
        document_name: &str,
        sender: Arc<broadcast::Sender<JobProgressEvent>>,
    ) -> Self {
        Self {
            job_id,
            document_name: document_name.to_string(),
            sender,
        }
    }

    pub fn update_phase(&self, phase: JobPhase, message: &str) {
        let event = JobProgressEvent::new(self.job_id, &self.document_name, phase, message);
        let _ = self.sender.send(event);
    }

    pub fn analyzing(&self, percent: u8, message: &str) {
        let mut event =
            JobProgressEvent::new(self.job_id, &self.document_name, JobPhase::Analyzing, message);
        event.percent = Some(percent);
        let _ = self.sender.send(event);
    }

    pub fn completed(&self) {
        let mut event = JobProgressEvent::new(
            self.job_id,
            &self.document_name,
            JobPhase::Completed,
            "Analysis completed",
        );
        event.percent = Some(100);
        let _ = self.sender.send(event);
    }

    pub fn failed(&self, error: &str) {
        let mut event = JobProgressEvent::new(
            self.job_id,
            &self.document_name,
            JobPhase::Failed,
            "Analysis failed",
        );
        event.error = Some(error.to_string());
        let _ = self.sender.send(event);
    }
}
