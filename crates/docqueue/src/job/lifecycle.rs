//! Job state machine.
//!
//! [`apply`] is the pure transition function. [`LifecycleController`]
//! persists its result through a compare-and-swap on the job row so that
//! concurrent callers cannot both win the same transition.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::model::{AnalysisResult, FailureCause, Job, JobId, JobState, JobStateKind, TimeoutPhase};
use crate::db::job_repo::CasOutcome;
use crate::db::DatabaseError;
use crate::store::JobStore;

/// Number of reload-and-retry rounds after a CAS conflict.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Inputs to the state machine.
///
/// Every event except `Dispatched` carries the dispatch token its sender
/// holds and only applies while that token is current.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Dispatched {
        token: String,
    },
    Succeeded {
        token: String,
        result: AnalysisResult,
    },
    Failed {
        token: String,
        cause: FailureCause,
    },
    TimedOut {
        token: String,
        limit: Duration,
        phase: TimeoutPhase,
    },
    Redelivered {
        previous_token: String,
        token: String,
    },
    RedeliveryExhausted {
        token: String,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Dispatched { .. } => "dispatched",
            JobEvent::Succeeded { .. } => "succeeded",
            JobEvent::Failed { .. } => "failed",
            JobEvent::TimedOut { .. } => "timed_out",
            JobEvent::Redelivered { .. } => "redelivered",
            JobEvent::RedeliveryExhausted { .. } => "redelivery_exhausted",
        }
    }

    /// The token this event must match, if any.
    fn held_token(&self) -> Option<&str> {
        match self {
            JobEvent::Dispatched { .. } => None,
            JobEvent::Succeeded { token, .. }
            | JobEvent::Failed { token, .. }
            | JobEvent::TimedOut { token, .. }
            | JobEvent::RedeliveryExhausted { token } => Some(token),
            JobEvent::Redelivered { previous_token, .. } => Some(previous_token),
        }
    }
}

/// Errors from state transitions.
#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("Event '{event}' is not valid in state '{from}'")]
    InvalidTransition {
        from: JobStateKind,
        event: &'static str,
    },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {job_id} kept changing during transition after {attempts} attempts")]
    Contended { job_id: JobId, attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Computes the next state for `event`, or rejects it.
pub fn apply(
    state: &JobState,
    event: &JobEvent,
    now: DateTime<Utc>,
) -> Result<JobState, TransitionError> {
    let invalid = || TransitionError::InvalidTransition {
        from: state.kind(),
        event: event.name(),
    };

    if let JobEvent::Dispatched { token } = event {
        return match state {
            JobState::Pending => Ok(JobState::Processing {
                started_at: now,
                dispatch_token: token.clone(),
                attempts: 1,
            }),
            _ => Err(invalid()),
        };
    }

    let JobState::Processing {
        started_at,
        dispatch_token,
        attempts,
    } = state
    else {
        return Err(invalid());
    };

    if event.held_token() != Some(dispatch_token.as_str()) {
        return Err(invalid());
    }

    let started_at = *started_at;
    let attempts = *attempts;
    let completed_at = now.max(started_at);
    let duration = (completed_at - started_at).to_std().unwrap_or_default();
    let failed = |error: FailureCause| JobState::Failed {
        started_at,
        completed_at,
        dispatch_token: dispatch_token.clone(),
        attempts,
        error,
        duration,
    };

    let next = match event {
        JobEvent::Succeeded { result, .. } => JobState::Completed {
            started_at,
            completed_at,
            dispatch_token: dispatch_token.clone(),
            attempts,
            result: result.clone(),
            duration,
        },
        JobEvent::Failed { cause, .. } => failed(cause.clone()),
        JobEvent::TimedOut { limit, phase, .. } => failed(FailureCause::Timeout {
            limit_ms: limit.as_millis() as u64,
            phase: *phase,
        }),
        JobEvent::Redelivered { token, .. } => JobState::Processing {
            started_at,
            dispatch_token: token.clone(),
            attempts: attempts.saturating_add(1),
        },
        JobEvent::RedeliveryExhausted { .. } => {
            failed(FailureCause::MaxRedeliveriesExceeded { attempts })
        }
        JobEvent::Dispatched { .. } => return Err(invalid()),
    };

    Ok(next)
}

/// Applies events to stored jobs.
#[derive(Clone)]
pub struct LifecycleController {
    store: JobStore,
    max_retries: u32,
}

impl LifecycleController {
    pub fn new(store: JobStore) -> Self {
        Self {
            store,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Applies `event` to the job, returning the job in its new state.
    pub fn transition(&self, id: &JobId, event: &JobEvent) -> Result<Job, TransitionError> {
        self.transition_at(id, event, Utc::now())
    }

    /// Like [`transition`](Self::transition) with an explicit clock.
    pub fn transition_at(
        &self,
        id: &JobId,
        event: &JobEvent,
        now: DateTime<Utc>,
    ) -> Result<Job, TransitionError> {
        let attempts = self.max_retries + 1;
        for _ in 0..attempts {
            let job = self.store.get(id)?.ok_or(TransitionError::NotFound(*id))?;
            let next = apply(&job.state, event, now)?;

            match self.store.compare_and_swap_state(
                id,
                job.state.kind(),
                job.state.dispatch_token(),
                &next,
            )? {
                CasOutcome::Applied => {
                    log::debug!(
                        "Job {} {} -> {} on '{}'",
                        id,
                        job.state.kind(),
                        next.kind(),
                        event.name()
                    );
                    return Ok(Job { state: next, ..job });
                }
                CasOutcome::Conflict => {
                    log::debug!("Job {} changed during '{}', re-evaluating", id, event.name());
                }
                CasOutcome::NotFound => return Err(TransitionError::NotFound(*id)),
            }
        }

        Err(TransitionError::Contended {
            job_id: *id,
            attempts,
        })
    }
}
