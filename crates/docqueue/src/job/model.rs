//! Job domain types.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique, never-reused job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque handle to a stored document plus its original file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub key: String,
    pub name: String,
}

/// Immutable job input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub document: DocumentRef,
    pub query: String,
}

/// Structured analysis output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub summary: String,
    #[serde(default)]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Which time limit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    Soft,
    Hard,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Soft => write!(f, "soft"),
            TimeoutPhase::Hard => write!(f, "hard"),
        }
    }
}

/// Why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The engine reported an error.
    Engine { message: String },
    /// The stored document could not be read.
    MalformedInput { reason: String },
    /// A time limit was exceeded.
    Timeout { limit_ms: u64, phase: TimeoutPhase },
    /// Too many deliveries died without an outcome.
    MaxRedeliveriesExceeded { attempts: u32 },
    /// The engine panicked.
    Panicked { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Engine { message } => write!(f, "engine error: {}", message),
            FailureCause::MalformedInput { reason } => write!(f, "malformed input: {}", reason),
            FailureCause::Timeout { limit_ms, phase } => {
                write!(f, "{} time limit of {}ms exceeded", phase, limit_ms)
            }
            FailureCause::MaxRedeliveriesExceeded { attempts } => {
                write!(f, "gave up after {} deliveries", attempts)
            }
            FailureCause::Panicked { message } => write!(f, "engine panicked: {}", message),
        }
    }
}

/// Coarse job state, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStateKind {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStateKind::Pending => "pending",
            JobStateKind::Processing => "processing",
            JobStateKind::Completed => "completed",
            JobStateKind::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStateKind::Completed | JobStateKind::Failed)
    }
}

impl fmt::Display for JobStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStateKind::Pending),
            "processing" => Ok(JobStateKind::Processing),
            "completed" => Ok(JobStateKind::Completed),
            "failed" => Ok(JobStateKind::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Job state with the data each state carries.
///
/// `result` exists only on `Completed` and `error` only on `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Processing {
        started_at: DateTime<Utc>,
        dispatch_token: String,
        attempts: u32,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        dispatch_token: String,
        attempts: u32,
        result: AnalysisResult,
        duration: Duration,
    },
    Failed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        dispatch_token: String,
        attempts: u32,
        error: FailureCause,
        duration: Duration,
    },
}

impl JobState {
    pub fn kind(&self) -> JobStateKind {
        match self {
            JobState::Pending => JobStateKind::Pending,
            JobState::Processing { .. } => JobStateKind::Processing,
            JobState::Completed { .. } => JobStateKind::Completed,
            JobState::Failed { .. } => JobStateKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Token of the delivery that last dispatched this job.
    pub fn dispatch_token(&self) -> Option<&str> {
        match self {
            JobState::Pending => None,
            JobState::Processing { dispatch_token, .. }
            | JobState::Completed { dispatch_token, .. }
            | JobState::Failed { dispatch_token, .. } => Some(dispatch_token),
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            JobState::Pending => 0,
            JobState::Processing { attempts, .. }
            | JobState::Completed { attempts, .. }
            | JobState::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Pending => None,
            JobState::Processing { started_at, .. }
            | JobState::Completed { started_at, .. }
            | JobState::Failed { started_at, .. } => Some(*started_at),
        }
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobState::Completed { completed_at, .. } | JobState::Failed { completed_at, .. } => {
                Some(*completed_at)
            }
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            JobState::Completed { duration, .. } | JobState::Failed { duration, .. } => {
                Some(*duration)
            }
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        match self {
            JobState::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FailureCause> {
        match self {
            JobState::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Advisory progress reported by the engine. Not part of the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub percent: u8,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// A job as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub input: JobInput,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub progress: Option<Progress>,
}

/// Client-facing snapshot of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub id: JobId,
    pub state: JobStateKind,
    pub document_name: String,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<AnalysisResult>,
    pub error: Option<FailureCause>,
    pub duration_ms: Option<u64>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            state: job.state.kind(),
            document_name: job.input.document.name.clone(),
            query: job.input.query.clone(),
            created_at: job.created_at,
            started_at: job.state.started_at(),
            completed_at: job.state.completed_at(),
            result: job.state.result().cloned(),
            error: job.state.error().cloned(),
            duration_ms: job.state.duration().map(|d| d.as_millis() as u64),
            attempts: job.state.attempts(),
            progress: job.progress.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_roundtrips_through_string() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_failure_cause_is_tagged() {
        let cause = FailureCause::Timeout {
            limit_ms: 1500,
            phase: TimeoutPhase::Hard,
        };
        let json = serde_json::to_value(&cause).unwrap();
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["limit_ms"], 1500);
        assert_eq!(json["phase"], "hard");
    }

    #[test]
    fn test_state_kind_parse() {
        assert_eq!("failed".parse::<JobStateKind>(), Ok(JobStateKind::Failed));
        assert!("ignored".parse::<JobStateKind>().is_err());
        assert!(JobStateKind::Completed.is_terminal());
        assert!(!JobStateKind::Processing.is_terminal());
    }

    #[test]
    fn test_status_view_serializes_camel_case() {
        let job = Job {
            id: JobId::new(),
            input: JobInput {
                document: DocumentRef {
                    key: "k".to_string(),
                    name: "q3.pdf".to_string(),
                },
                query: "summarize".to_string(),
            },
            state: JobState::Pending,
            created_at: Utc::now(),
            progress: None,
        };
        let json = serde_json::to_value(JobStatusView::from(&job)).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["documentName"], "q3.pdf");
        assert!(json["result"].is_null());
        assert!(json["error"].is_null());
        assert!(json.get("progress").is_none());
    }
}
