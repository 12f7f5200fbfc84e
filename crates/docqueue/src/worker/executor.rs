//! Handles one leased delivery from start to ack.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::{debug, error, info, info_span, warn};

use super::limits::{LimitClock, LimitEvent, TimeLimits};
use super::progress::BroadcastProgress;
use crate::broadcast::{JobPhase, JobProgressBroadcaster, JobProgressTracker};
use crate::engine::{AnalysisEngine, AnalysisRequest, EngineContext, EngineError};
use crate::error::{DocqueueError, SpawnError};
use crate::job::{
    AnalysisResult, FailureCause, Job, JobEvent, JobState, JobStateKind, LifecycleController,
    TimeoutPhase, TransitionError,
};
use crate::queue::{AckOutcome, Lease, Queue};
use crate::storage::DocumentStorage;
use crate::store::JobStore;

/// Shortest interval between lease renewals.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub limits: TimeLimits,
    /// Deliveries a job may consume before it is failed.
    pub max_deliveries: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            limits: TimeLimits::default(),
            max_deliveries: 3,
        }
    }
}

/// Why a delivery was acked without running the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The job no longer exists.
    Missing,
    /// The job already finished.
    AlreadyTerminal,
    /// Another live delivery owns the job.
    DuplicateDelivery,
    /// The job changed underneath this delivery.
    Superseded,
    /// The message exceeded its delivery budget and the job could not be
    /// failed in its place.
    DeadLettered,
}

/// What happened to a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Completed,
    Failed(FailureCause),
    Discarded(DiscardReason),
}

/// How the engine call ended.
enum EngineOutcome {
    Returned(Result<AnalysisResult, EngineError>),
    Panicked(String),
    HardTimeout,
}

/// Runs jobs for leased deliveries.
pub struct Executor {
    controller: LifecycleController,
    queue: Arc<dyn Queue>,
    storage: Arc<dyn DocumentStorage>,
    engine: Arc<dyn AnalysisEngine>,
    progress: JobProgressBroadcaster,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(
        store: JobStore,
        queue: Arc<dyn Queue>,
        storage: Arc<dyn DocumentStorage>,
        engine: Arc<dyn AnalysisEngine>,
        progress: JobProgressBroadcaster,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            controller: LifecycleController::new(store),
            queue,
            storage,
            engine,
            progress,
            settings,
        }
    }

    pub fn store(&self) -> &JobStore {
        self.controller.store()
    }

    /// Processes one delivery and acks it.
    ///
    /// Errors are infrastructure failures; the lease is left to expire so
    /// the message is redelivered.
    pub fn handle(&self, lease: &Lease) -> Result<Disposition, DocqueueError> {
        let _span = info_span!("job",
            job_id = %lease.job_id,
            delivery = lease.deliveries,
        )
        .entered();

        if lease.deliveries > self.settings.max_deliveries {
            return self.dead_letter(lease);
        }

        let Some(job) = self.store().get(&lease.job_id)? else {
            debug!("Job {} no longer exists, discarding delivery", lease.job_id);
            return self.discard(lease, DiscardReason::Missing);
        };
        if job.state.is_terminal() {
            debug!("Job {} already {}, discarding delivery", job.id, job.state.kind());
            return self.discard(lease, DiscardReason::AlreadyTerminal);
        }

        let tracker = self.progress.track(job.id, &job.input.document.name);

        let current_token = job.state.dispatch_token().map(str::to_string);
        let job = match (job.state.kind(), current_token) {
            (JobStateKind::Pending, _) => {
                let event = JobEvent::Dispatched {
                    token: lease.token.clone(),
                };
                match self.transition(&job, &event)? {
                    Some(job) => job,
                    None => return self.discard(lease, DiscardReason::Superseded),
                }
            }
            (JobStateKind::Processing, Some(current)) if current == lease.token => job,
            (JobStateKind::Processing, Some(current)) => {
                if self.queue.lease_active(&current)? {
                    debug!(
                        "Job {} is held by a live delivery, discarding duplicate",
                        job.id
                    );
                    return self.discard(lease, DiscardReason::DuplicateDelivery);
                }

                let attempts = job.state.attempts();
                if attempts >= self.settings.max_deliveries {
                    warn!(
                        "Job {} lost its worker {} times, giving up",
                        job.id, attempts
                    );
                    let event = JobEvent::RedeliveryExhausted { token: current };
                    return match self.transition(&job, &event)? {
                        Some(failed) => self.finish(lease, &failed, None, &tracker),
                        None => self.discard(lease, DiscardReason::Superseded),
                    };
                }

                info!(
                    "Job {} previous delivery died, resuming (attempt {})",
                    job.id,
                    attempts + 1
                );
                let event = JobEvent::Redelivered {
                    previous_token: current,
                    token: lease.token.clone(),
                };
                match self.transition(&job, &event)? {
                    Some(job) => job,
                    None => return self.discard(lease, DiscardReason::Superseded),
                }
            }
            _ => return self.discard(lease, DiscardReason::AlreadyTerminal),
        };

        tracker.update_phase(JobPhase::Dispatched, "Picked up by worker");

        let content = match self.storage.read(&job.input.document) {
            Ok(content) => content,
            Err(e) => {
                warn!("Job {} document unreadable: {}", job.id, e);
                let event = JobEvent::Failed {
                    token: lease.token.clone(),
                    cause: FailureCause::MalformedInput {
                        reason: e.to_string(),
                    },
                };
                return match self.transition(&job, &event)? {
                    Some(failed) => self.finish(lease, &failed, None, &tracker),
                    None => self.discard(lease, DiscardReason::Superseded),
                };
            }
        };
        let document_bytes = content.len() as u64;

        let request = AnalysisRequest {
            job_id: job.id,
            document: job.input.document.clone(),
            content,
            query: job.input.query.clone(),
        };
        let reporter = Arc::new(BroadcastProgress::new(
            self.store().clone(),
            job.id,
            &lease.token,
            tracker.clone(),
        ));
        let cancelled = Arc::new(AtomicBool::new(false));
        let ctx = EngineContext::new(reporter, Arc::clone(&cancelled));

        let mut clock = LimitClock::start(self.settings.limits);
        let outcome = self.run_engine(lease, request, ctx, &cancelled, &mut clock)?;

        let event = match outcome {
            EngineOutcome::Returned(Ok(mut result)) => {
                if result.model.is_none() {
                    result.model = Some(self.engine.name().to_string());
                }
                JobEvent::Succeeded {
                    token: lease.token.clone(),
                    result,
                }
            }
            EngineOutcome::Returned(Err(EngineError::Cancelled)) if clock.soft_fired() => {
                JobEvent::TimedOut {
                    token: lease.token.clone(),
                    limit: clock.limits().soft,
                    phase: TimeoutPhase::Soft,
                }
            }
            EngineOutcome::Returned(Err(e)) => JobEvent::Failed {
                token: lease.token.clone(),
                cause: FailureCause::Engine {
                    message: e.to_string(),
                },
            },
            EngineOutcome::Panicked(message) => JobEvent::Failed {
                token: lease.token.clone(),
                cause: FailureCause::Panicked { message },
            },
            EngineOutcome::HardTimeout => JobEvent::TimedOut {
                token: lease.token.clone(),
                limit: clock.limits().hard,
                phase: TimeoutPhase::Hard,
            },
        };

        match self.transition(&job, &event)? {
            Some(done) => self.finish(lease, &done, Some(document_bytes), &tracker),
            None => self.discard(lease, DiscardReason::Superseded),
        }
    }

    /// Retires a message that has been delivered more often than allowed.
    ///
    /// A readable job is failed with `MaxRedeliveriesExceeded`; anything else
    /// is logged and the message acked, so a poisoned job cannot loop.
    fn dead_letter(&self, lease: &Lease) -> Result<Disposition, DocqueueError> {
        let job = match self.store().get(&lease.job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return self.discard(lease, DiscardReason::Missing),
            Err(e) => {
                error!(
                    "Dropping message {} after {} deliveries, job {} is unreadable: {}",
                    lease.message_id, lease.deliveries, lease.job_id, e
                );
                return self.discard(lease, DiscardReason::DeadLettered);
            }
        };

        let tracker = self.progress.track(job.id, &job.input.document.name);
        let current_token = job.state.dispatch_token().map(str::to_string);
        let token = match (job.state.kind(), current_token) {
            (JobStateKind::Pending, _) => {
                let event = JobEvent::Dispatched {
                    token: lease.token.clone(),
                };
                if self.transition(&job, &event)?.is_none() {
                    return self.discard(lease, DiscardReason::Superseded);
                }
                lease.token.clone()
            }
            (JobStateKind::Processing, Some(current)) => {
                if current != lease.token && self.queue.lease_active(&current)? {
                    return self.discard(lease, DiscardReason::DuplicateDelivery);
                }
                current
            }
            _ => return self.discard(lease, DiscardReason::AlreadyTerminal),
        };

        error!(
            "Message {} for job {} delivered {} times, failing the job",
            lease.message_id, job.id, lease.deliveries
        );
        match self.transition(&job, &JobEvent::RedeliveryExhausted { token })? {
            Some(failed) => self.finish(lease, &failed, None, &tracker),
            None => self.discard(lease, DiscardReason::Superseded),
        }
    }

    /// Runs the engine on its own thread, renewing the lease while waiting
    /// and enforcing the time limits.
    fn run_engine(
        &self,
        lease: &Lease,
        request: AnalysisRequest,
        ctx: EngineContext,
        cancelled: &AtomicBool,
        clock: &mut LimitClock,
    ) -> Result<EngineOutcome, DocqueueError> {
        let (tx, rx) = bounded(1);
        let engine = Arc::clone(&self.engine);
        let job_id = request.job_id;

        let thread_name = format!("engine-{}", job_id);
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| engine.analyze(&request, &ctx)));
                // The executor may have stopped waiting after a hard timeout.
                let _ = tx.send(result);
            })
            .map_err(|e| SpawnError::new(thread_name, e))?;

        let heartbeat = (self.queue.lease_duration() / 3).max(MIN_HEARTBEAT);
        let mut next_heartbeat = Instant::now() + heartbeat;

        loop {
            let now = Instant::now();
            match clock.poll(now) {
                LimitEvent::HardReached => {
                    cancelled.store(true, Ordering::Relaxed);
                    warn!(
                        "Job {} exceeded hard limit of {:?}, abandoning engine",
                        job_id,
                        clock.limits().hard
                    );
                    return Ok(EngineOutcome::HardTimeout);
                }
                LimitEvent::SoftReached => {
                    cancelled.store(true, Ordering::Relaxed);
                    warn!(
                        "Job {} exceeded soft limit of {:?}, requesting cancellation",
                        job_id,
                        clock.limits().soft
                    );
                }
                LimitEvent::Running => {}
            }

            if now >= next_heartbeat {
                match self.queue.extend_lease(&lease.token) {
                    Ok(true) => {}
                    Ok(false) => warn!("Lease for job {} was lost while running", job_id),
                    Err(e) => warn!("Failed to extend lease for job {}: {}", job_id, e),
                }
                next_heartbeat = now + heartbeat;
            }

            let wake = clock.next_deadline().min(next_heartbeat);
            match rx.recv_timeout(wake.saturating_duration_since(now)) {
                Ok(Ok(result)) => return Ok(EngineOutcome::Returned(result)),
                Ok(Err(payload)) => return Ok(EngineOutcome::Panicked(panic_message(&*payload))),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Ok(EngineOutcome::Panicked(
                        "engine thread exited without a result".to_string(),
                    ))
                }
            }
        }
    }

    /// Applies an event, mapping "someone else got there first" to `None`.
    fn transition(&self, job: &Job, event: &JobEvent) -> Result<Option<Job>, DocqueueError> {
        match self.controller.transition(&job.id, event) {
            Ok(job) => Ok(Some(job)),
            Err(e @ (TransitionError::InvalidTransition { .. } | TransitionError::NotFound(_))) => {
                debug!("Job {}: {}", job.id, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Records metrics and progress for a terminal job and acks.
    fn finish(
        &self,
        lease: &Lease,
        job: &Job,
        document_bytes: Option<u64>,
        tracker: &JobProgressTracker,
    ) -> Result<Disposition, DocqueueError> {
        if let Err(e) = self.store().record_metrics(job, document_bytes) {
            warn!("Failed to record metrics for job {}: {}", job.id, e);
        }

        let disposition = match &job.state {
            JobState::Failed { error, .. } => {
                info!("Job {} failed: {}", job.id, error);
                tracker.failed(&error.to_string());
                Disposition::Failed(error.clone())
            }
            _ => {
                info!(
                    "Job {} completed in {}ms",
                    job.id,
                    job.state.duration().map(|d| d.as_millis()).unwrap_or_default()
                );
                tracker.completed();
                Disposition::Completed
            }
        };

        self.ack(lease)?;
        Ok(disposition)
    }

    fn discard(&self, lease: &Lease, reason: DiscardReason) -> Result<Disposition, DocqueueError> {
        self.ack(lease)?;
        Ok(Disposition::Discarded(reason))
    }

    fn ack(&self, lease: &Lease) -> Result<(), DocqueueError> {
        if self.queue.ack(&lease.token)? == AckOutcome::LeaseLost {
            debug!(
                "Lease {} for job {} was already gone at ack",
                lease.token, lease.job_id
            );
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::engine::StubEngine;
    use crate::job::{JobInput, JobStateKind};
    use crate::queue::SqliteQueue;
    use crate::storage::FileStorage;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: JobStore,
        queue: Arc<SqliteQueue>,
        storage: Arc<FileStorage>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        Fixture {
            store: JobStore::new(db.clone()),
            queue: Arc::new(SqliteQueue::new(
                db,
                Duration::from_secs(30),
                Duration::from_millis(10),
            )),
            storage: Arc::new(FileStorage::new(dir.path())),
            _dir: dir,
        }
    }

    fn executor(f: &Fixture, engine: Arc<dyn AnalysisEngine>) -> Executor {
        Executor::new(
            f.store.clone(),
            f.queue.clone(),
            f.storage.clone(),
            engine,
            JobProgressBroadcaster::default(),
            ExecutorSettings {
                limits: TimeLimits::new(Duration::from_secs(5), Duration::from_secs(10)),
                max_deliveries: 3,
            },
        )
    }

    fn submit(f: &Fixture, content: &[u8]) -> Job {
        let document = f.storage.put("notes.txt", content).unwrap();
        let job = f
            .store
            .create(
                JobInput {
                    document,
                    query: "summarize".to_string(),
                },
                "",
                content.len() as u64,
            )
            .unwrap();
        f.queue.enqueue(&job.id).unwrap();
        job
    }

    struct Panicking;

    impl AnalysisEngine for Panicking {
        fn analyze(
            &self,
            _request: &AnalysisRequest,
            _ctx: &EngineContext,
        ) -> Result<AnalysisResult, EngineError> {
            panic!("engine exploded")
        }
    }

    #[test]
    fn test_completes_job_and_acks() {
        let f = fixture();
        let job = submit(&f, b"line one\nline two\n");
        let exec = executor(&f, Arc::new(StubEngine));

        let lease = f.queue.dequeue(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(exec.handle(&lease).unwrap(), Disposition::Completed);

        let done = f.store.get(&job.id).unwrap().unwrap();
        assert_eq!(done.state.kind(), JobStateKind::Completed);
        assert!(done.state.result().is_some());
        assert!(!f.queue.contains_job(&job.id).unwrap());
        assert_eq!(f.store.metrics(&job.id).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_document_is_malformed_input() {
        let f = fixture();
        let job = submit(&f, b"content");
        f.storage.delete(&job.input.document).unwrap();
        let exec = executor(&f, Arc::new(StubEngine));

        let lease = f.queue.dequeue(Duration::from_millis(100)).unwrap().unwrap();
        let disposition = exec.handle(&lease).unwrap();
        assert!(matches!(
            disposition,
            Disposition::Failed(FailureCause::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let f = fixture();
        let job = submit(&f, b"content");
        let exec = executor(&f, Arc::new(Panicking));

        let lease = f.queue.dequeue(Duration::from_millis(100)).unwrap().unwrap();
        exec.handle(&lease).unwrap();

        let failed = f.store.get(&job.id).unwrap().unwrap();
        assert_eq!(
            failed.state.error(),
            Some(&FailureCause::Panicked {
                message: "engine exploded".to_string()
            })
        );
        assert!(failed.state.result().is_none());
    }

    #[test]
    fn test_delivery_for_missing_job_is_discarded() {
        let f = fixture();
        f.queue.enqueue(&crate::job::JobId::new()).unwrap();
        let exec = executor(&f, Arc::new(StubEngine));

        let lease = f.queue.dequeue(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(
            exec.handle(&lease).unwrap(),
            Disposition::Discarded(DiscardReason::Missing)
        );
        assert_eq!(f.queue.depth().unwrap().ready, 0);
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*boxed), "static");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*boxed), "owned");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*boxed), "unknown panic payload");
    }
}
