use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use uuid::Uuid;

use super::{AckOutcome, Lease, MessageId, Queue, QueueDepth};
use crate::db::queue_repo::{self, QueueRow};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::error::QueueError;
use crate::job::JobId;

/// Pending wake-ups buffered for idle consumers.
const WAKE_CAPACITY: usize = 64;

/// Queue stored in the `dispatch_queue` table.
///
/// Consumers sharing this handle are woken by `enqueue`; consumers in other
/// processes find new messages on their next poll.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Database,
    lease: Duration,
    poll_interval: Duration,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl SqliteQueue {
    pub fn new(db: Database, lease: Duration, poll_interval: Duration) -> Self {
        let (wake_tx, wake_rx) = bounded(WAKE_CAPACITY);
        Self {
            db,
            lease,
            poll_interval,
            wake_tx,
            wake_rx,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero())
    }

    /// Claims one visible message at `now`, if any.
    ///
    /// A message that cannot be decoded is removed under the claim token and
    /// reported as [`QueueError::CorruptMessage`].
    pub fn try_dequeue_at(&self, now: DateTime<Utc>) -> Result<Option<Lease>, QueueError> {
        let token = Uuid::new_v4().to_string();
        let expires_at = self.lease_until(now);
        let Some(row) = queue_repo::claim(
            &self.db,
            &format_timestamp(now),
            &token,
            &format_timestamp(expires_at),
        )?
        else {
            return Ok(None);
        };

        match to_lease(row) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                log::error!("Dropping undecodable queue message: {}", e);
                queue_repo::delete_by_token(&self.db, &token)?;
                Err(e)
            }
        }
    }

    fn wake_one(&self) {
        match self.wake_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                log::warn!("Queue wake-up channel disconnected");
            }
        }
    }
}

fn to_lease(row: QueueRow) -> Result<Lease, QueueError> {
    let corrupt = |reason: String| QueueError::CorruptMessage {
        message_id: row.message_id.clone(),
        reason,
    };
    let job_id: JobId = row
        .job_id
        .parse()
        .map_err(|e| corrupt(format!("invalid job id: {}", e)))?;
    let token = row
        .lease_token
        .clone()
        .ok_or_else(|| corrupt("claimed message has no lease token".to_string()))?;
    let expires_at = row
        .leased_until
        .as_deref()
        .ok_or_else(|| corrupt("claimed message has no lease expiry".to_string()))
        .and_then(|s| parse_timestamp(s).map_err(|e| corrupt(e.to_string())))?;

    Ok(Lease {
        message_id: MessageId(row.message_id.clone()),
        job_id,
        token,
        deliveries: row.deliveries,
        expires_at,
    })
}

impl Queue for SqliteQueue {
    fn enqueue(&self, job_id: &JobId) -> Result<MessageId, QueueError> {
        let message_id = Uuid::new_v4().to_string();
        queue_repo::insert(
            &self.db,
            &message_id,
            &job_id.to_string(),
            &format_timestamp(Utc::now()),
        )?;
        log::debug!("Enqueued job {} as message {}", job_id, message_id);
        self.wake_one();
        Ok(MessageId(message_id))
    }

    fn dequeue(&self, timeout: Duration) -> Result<Option<Lease>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_dequeue_at(Utc::now())? {
                if lease.deliveries > 1 {
                    log::info!(
                        "Redelivering message {} for job {} (delivery {})",
                        lease.message_id,
                        lease.job_id,
                        lease.deliveries
                    );
                }
                return Ok(Some(lease));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A wake-up, a timeout and a disconnect all mean "poll again".
            let _ = self.wake_rx.recv_timeout(remaining.min(self.poll_interval));
        }
    }

    fn ack(&self, token: &str) -> Result<AckOutcome, QueueError> {
        if queue_repo::delete_by_token(&self.db, token)? {
            Ok(AckOutcome::Acknowledged)
        } else {
            log::debug!("Ack for lease {} found no message", token);
            Ok(AckOutcome::LeaseLost)
        }
    }

    fn extend_lease(&self, token: &str) -> Result<bool, QueueError> {
        let now = Utc::now();
        Ok(queue_repo::extend(
            &self.db,
            token,
            &format_timestamp(now),
            &format_timestamp(self.lease_until(now)),
        )?)
    }

    fn lease_active(&self, token: &str) -> Result<bool, QueueError> {
        Ok(queue_repo::lease_active(
            &self.db,
            token,
            &format_timestamp(Utc::now()),
        )?)
    }

    fn contains_job(&self, job_id: &JobId) -> Result<bool, QueueError> {
        Ok(queue_repo::contains_job(&self.db, &job_id.to_string())?)
    }

    fn depth(&self) -> Result<QueueDepth, QueueError> {
        let (ready, leased) = queue_repo::depth(&self.db, &format_timestamp(Utc::now()))?;
        Ok(QueueDepth { ready, leased })
    }

    fn lease_duration(&self) -> Duration {
        self.lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn queue(lease_ms: u64) -> SqliteQueue {
        SqliteQueue::new(
            Database::open_in_memory().unwrap(),
            Duration::from_millis(lease_ms),
            Duration::from_millis(20),
        )
    }

    #[test]
    fn test_enqueue_dequeue_ack() {
        let q = queue(5_000);
        let job_id = JobId::new();
        q.enqueue(&job_id).unwrap();
        assert!(q.contains_job(&job_id).unwrap());

        let lease = q.dequeue(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(lease.job_id, job_id);
        assert_eq!(lease.deliveries, 1);
        assert!(q.lease_active(&lease.token).unwrap());
        assert_eq!(q.depth().unwrap(), QueueDepth { ready: 0, leased: 1 });

        assert_eq!(q.ack(&lease.token).unwrap(), AckOutcome::Acknowledged);
        assert_eq!(q.ack(&lease.token).unwrap(), AckOutcome::LeaseLost);
        assert!(!q.contains_job(&job_id).unwrap());
    }

    #[test]
    fn test_dequeue_times_out_on_empty_queue() {
        let q = queue(5_000);
        let start = Instant::now();
        assert!(q.dequeue(Duration::from_millis(60)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_expired_lease_is_redelivered_with_new_token() {
        let q = queue(5_000);
        let job_id = JobId::new();
        q.enqueue(&job_id).unwrap();

        let now = Utc::now();
        let first = q.try_dequeue_at(now).unwrap().unwrap();
        assert!(q.try_dequeue_at(now).unwrap().is_none());

        let later = now + chrono::Duration::seconds(6);
        let second = q.try_dequeue_at(later).unwrap().unwrap();
        assert_eq!(second.job_id, job_id);
        assert_eq!(second.deliveries, 2);
        assert_ne!(second.token, first.token);

        assert_eq!(q.ack(&first.token).unwrap(), AckOutcome::LeaseLost);
        assert_eq!(q.ack(&second.token).unwrap(), AckOutcome::Acknowledged);
    }

    #[test]
    fn test_extend_lease_keeps_message_invisible() {
        let q = queue(400);
        q.enqueue(&JobId::new()).unwrap();
        let lease = q.dequeue(Duration::from_millis(100)).unwrap().unwrap();

        for _ in 0..4 {
            thread::sleep(Duration::from_millis(60));
            assert!(q.extend_lease(&lease.token).unwrap());
        }
        assert!(q.dequeue(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_undecodable_message_is_dropped() {
        let q = queue(5_000);
        q.database()
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO dispatch_queue (message_id, job_id, enqueued_at) VALUES ('m1', 'not-a-uuid', ?1)",
                    [format_timestamp(Utc::now())],
                )?;
                Ok(())
            })
            .unwrap();

        match q.try_dequeue_at(Utc::now()) {
            Err(QueueError::CorruptMessage { message_id, .. }) => assert_eq!(message_id, "m1"),
            other => panic!("unexpected dequeue result: {:?}", other.map(|l| l.is_some())),
        }
        assert_eq!(q.depth().unwrap(), QueueDepth { ready: 0, leased: 0 });
        assert!(q.dequeue(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn test_waiting_consumer_is_woken_by_enqueue() {
        let q = Arc::new(SqliteQueue::new(
            Database::open_in_memory().unwrap(),
            Duration::from_secs(5),
            Duration::from_secs(10),
        ));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.dequeue(Duration::from_secs(5)).unwrap())
        };

        thread::sleep(Duration::from_millis(50));
        let job_id = JobId::new();
        let start = Instant::now();
        q.enqueue(&job_id).unwrap();

        let lease = consumer.join().unwrap().unwrap();
        assert_eq!(lease.job_id, job_id);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
