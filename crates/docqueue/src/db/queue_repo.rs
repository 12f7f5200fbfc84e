//! Dispatch queue repository: the `dispatch_queue` table backing
//! [`SqliteQueue`](crate::queue::SqliteQueue).
//!
//! A message is visible when it has no lease or its lease expired.
//! Claiming a message replaces its lease token, so a token identifies
//! exactly one delivery.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw queue message row.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRow {
    pub message_id: String,
    pub job_id: String,
    pub enqueued_at: String,
    pub lease_token: Option<String>,
    pub leased_until: Option<String>,
    pub deliveries: u32,
}

impl QueueRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            message_id: row.get("message_id")?,
            job_id: row.get("job_id")?,
            enqueued_at: row.get("enqueued_at")?,
            lease_token: row.get("lease_token")?,
            leased_until: row.get("leased_until")?,
            deliveries: row.get("deliveries")?,
        })
    }
}

/// Inserts a new, unleased message.
pub fn insert(
    db: &Database,
    message_id: &str,
    job_id: &str,
    enqueued_at: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO dispatch_queue (message_id, job_id, enqueued_at) VALUES (?1, ?2, ?3)",
            params![message_id, job_id, enqueued_at],
        )?;
        Ok(())
    })
}

/// Claims the oldest visible message at `now`, leasing it to `token`
/// until `leased_until`. Returns the updated row.
pub fn claim(
    db: &Database,
    now: &str,
    token: &str,
    leased_until: &str,
) -> Result<Option<QueueRow>, DatabaseError> {
    db.with_transaction(|tx| {
        let candidate: Option<String> = tx
            .query_row(
                "SELECT message_id FROM dispatch_queue
                 WHERE lease_token IS NULL OR leased_until < ?1
                 ORDER BY enqueued_at ASC LIMIT 1",
                params![now],
                |r| r.get(0),
            )
            .optional()?;

        let Some(message_id) = candidate else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE dispatch_queue
             SET lease_token = ?2, leased_until = ?3, deliveries = deliveries + 1
             WHERE message_id = ?1",
            params![message_id, token, leased_until],
        )?;

        let row = tx.query_row(
            "SELECT * FROM dispatch_queue WHERE message_id = ?1",
            params![message_id],
            QueueRow::from_row,
        )?;
        Ok(Some(row))
    })
}

/// Removes the message currently leased to `token`.
pub fn delete_by_token(db: &Database, token: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "DELETE FROM dispatch_queue WHERE lease_token = ?1",
            params![token],
        )?;
        Ok(changed > 0)
    })
}

/// Pushes out the lease held by `token` if it has not expired at `now`.
pub fn extend(
    db: &Database,
    token: &str,
    now: &str,
    leased_until: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE dispatch_queue SET leased_until = ?3
             WHERE lease_token = ?1 AND leased_until >= ?2",
            params![token, now, leased_until],
        )?;
        Ok(changed > 0)
    })
}

/// Whether `token` still holds an unexpired lease at `now`.
pub fn lease_active(db: &Database, token: &str, now: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let active: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM dispatch_queue
             WHERE lease_token = ?1 AND leased_until >= ?2)",
            params![token, now],
            |r| r.get(0),
        )?;
        Ok(active)
    })
}

/// Whether any message (leased or not) references `job_id`.
pub fn contains_job(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let found: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM dispatch_queue WHERE job_id = ?1)",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(found)
    })
}

/// Counts (ready, leased) messages at `now`.
pub fn depth(db: &Database, now: &str) -> Result<(u64, u64), DatabaseError> {
    db.with_conn(|conn| {
        let (ready, leased): (u64, u64) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN lease_token IS NULL OR leased_until < ?1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN lease_token IS NOT NULL AND leased_until >= ?1 THEN 1 ELSE 0 END), 0)
             FROM dispatch_queue",
            params![now],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        Ok((ready, leased))
    })
}
