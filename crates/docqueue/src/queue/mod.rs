//! At-least-once dispatch of job ids to workers.
//!
//! A dequeued message is leased, not removed. It stays invisible until the
//! lease expires or the holder acks it; an expired lease makes the message
//! visible again under a new token.

pub mod sqlite;

pub use sqlite::SqliteQueue;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::QueueError;
use crate::job::JobId;

/// Identifier of one queued message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One delivery of a message to one consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub message_id: MessageId,
    pub job_id: JobId,
    /// Unique per delivery.
    pub token: String,
    /// How many times this message has been handed out, this one included.
    pub deliveries: u32,
    pub expires_at: DateTime<Utc>,
}

/// Result of acknowledging a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    /// The lease expired and the message was handed to someone else, or it
    /// was already acked.
    LeaseLost,
}

/// Message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    pub ready: u64,
    pub leased: u64,
}

/// Durable work queue.
pub trait Queue: Send + Sync {
    fn enqueue(&self, job_id: &JobId) -> Result<MessageId, QueueError>;

    /// Waits up to `timeout` for a visible message and leases it.
    fn dequeue(&self, timeout: Duration) -> Result<Option<Lease>, QueueError>;

    fn ack(&self, token: &str) -> Result<AckOutcome, QueueError>;

    /// Renews a live lease. Returns false if it already expired or was lost.
    fn extend_lease(&self, token: &str) -> Result<bool, QueueError>;

    fn lease_active(&self, token: &str) -> Result<bool, QueueError>;

    /// Whether any message, leased or not, references the job.
    fn contains_job(&self, job_id: &JobId) -> Result<bool, QueueError>;

    fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Length of a fresh lease.
    fn lease_duration(&self) -> Duration;
}
