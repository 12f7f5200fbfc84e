//! Durable job store backed by the `jobs`, `analysis_history` and
//! `analysis_metrics` tables.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::history_repo::{self, HistoryRow};
use crate::db::job_repo::{self, CasOutcome, JobFilter, JobRow, StateColumns};
use crate::db::metrics_repo::{self, MetricsRow};
use crate::db::stats_repo::{self, StatsSummary};
use crate::db::{format_timestamp, parse_timestamp, Database, DatabaseError};
use crate::job::{
    AnalysisResult, DocumentRef, FailureCause, Job, JobId, JobInput, JobState, JobStateKind,
    JobStatusView, Progress,
};

/// Category recorded on history rows when the submitter gives none.
pub const DEFAULT_CATEGORY: &str = "general";

// ─── Row codec ──────────────────────────────────────────────────────────────

fn corrupt(id: &str, reason: impl Into<String>) -> DatabaseError {
    DatabaseError::CorruptRow {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn required<'a>(id: &str, field: &str, value: &'a Option<String>) -> Result<&'a str, DatabaseError> {
    value
        .as_deref()
        .ok_or_else(|| corrupt(id, format!("missing {}", field)))
}

fn timestamp(id: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    parse_timestamp(s).map_err(|e| match e {
        DatabaseError::CorruptRow { reason, .. } => corrupt(id, reason),
        other => other,
    })
}

fn decode(row: JobRow) -> Result<Job, DatabaseError> {
    let id_str = row.id.as_str();
    let id: JobId = id_str
        .parse()
        .map_err(|e| corrupt(id_str, format!("invalid id: {}", e)))?;
    let kind: JobStateKind = row.state.parse().map_err(|e: String| corrupt(id_str, e))?;

    let state = match kind {
        JobStateKind::Pending => JobState::Pending,
        JobStateKind::Processing => JobState::Processing {
            started_at: timestamp(id_str, required(id_str, "started_at", &row.started_at)?)?,
            dispatch_token: required(id_str, "dispatch_token", &row.dispatch_token)?.to_string(),
            attempts: row.attempts,
        },
        JobStateKind::Completed | JobStateKind::Failed => {
            let started_at = timestamp(id_str, required(id_str, "started_at", &row.started_at)?)?;
            let completed_at =
                timestamp(id_str, required(id_str, "completed_at", &row.completed_at)?)?;
            if completed_at < started_at {
                return Err(corrupt(id_str, "completed_at precedes started_at"));
            }
            let dispatch_token =
                required(id_str, "dispatch_token", &row.dispatch_token)?.to_string();
            let duration_ms = row
                .duration_ms
                .ok_or_else(|| corrupt(id_str, "missing duration_ms"))?;
            let duration = Duration::from_millis(duration_ms.max(0) as u64);

            if kind == JobStateKind::Completed {
                if row.error.is_some() {
                    return Err(corrupt(id_str, "completed job carries an error"));
                }
                let result: AnalysisResult =
                    serde_json::from_str(required(id_str, "result", &row.result)?)?;
                JobState::Completed {
                    started_at,
                    completed_at,
                    dispatch_token,
                    attempts: row.attempts,
                    result,
                    duration,
                }
            } else {
                if row.result.is_some() {
                    return Err(corrupt(id_str, "failed job carries a result"));
                }
                let error: FailureCause =
                    serde_json::from_str(required(id_str, "error", &row.error)?)?;
                JobState::Failed {
                    started_at,
                    completed_at,
                    dispatch_token,
                    attempts: row.attempts,
                    error,
                    duration,
                }
            }
        }
    };

    let progress = match row.progress.as_deref() {
        Some(raw) => match serde_json::from_str::<Progress>(raw) {
            Ok(p) => Some(p),
            Err(e) => {
                log::warn!("Ignoring unreadable progress on job {}: {}", id, e);
                None
            }
        },
        None => None,
    };

    Ok(Job {
        id,
        input: JobInput {
            document: DocumentRef {
                key: row.document_key,
                name: row.document_name,
            },
            query: row.query,
        },
        state,
        created_at: timestamp(id_str, &row.created_at)?,
        progress,
    })
}

fn encode_state(state: &JobState) -> Result<StateColumns, DatabaseError> {
    let mut cols = StateColumns {
        state: state.kind().as_str().to_string(),
        dispatch_token: state.dispatch_token().map(str::to_string),
        attempts: state.attempts(),
        started_at: state.started_at().map(format_timestamp),
        completed_at: state.completed_at().map(format_timestamp),
        duration_ms: state.duration().map(|d| d.as_millis() as i64),
        ..Default::default()
    };
    match state {
        JobState::Completed { result, .. } => cols.result = Some(serde_json::to_string(result)?),
        JobState::Failed { error, .. } => cols.error = Some(serde_json::to_string(error)?),
        _ => {}
    }
    Ok(cols)
}

/// Decodes rows for a listing; corrupt rows are logged and skipped.
fn decode_all(rows: Vec<JobRow>) -> Vec<Job> {
    rows.into_iter()
        .filter_map(|row| match decode(row) {
            Ok(job) => Some(job),
            Err(e) => {
                log::error!("Skipping corrupt job row: {}", e);
                None
            }
        })
        .collect()
}

fn decode_page(rows: Vec<JobRow>) -> ScanPage {
    let total = rows.len() as u64;
    let jobs = decode_all(rows);
    ScanPage {
        unreadable: total - jobs.len() as u64,
        jobs,
    }
}

/// One page of a maintenance scan.
#[derive(Debug, Default)]
pub struct ScanPage {
    pub jobs: Vec<Job>,
    /// Rows in the page that could not be decoded.
    pub unreadable: u64,
}

impl ScanPage {
    /// Rows the page consumed from the underlying query.
    pub fn rows(&self) -> u64 {
        self.jobs.len() as u64 + self.unreadable
    }
}

/// Full dump of the job table and the analysis history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportData {
    pub exported_at: DateTime<Utc>,
    pub jobs: Vec<JobStatusView>,
    pub history: Vec<HistoryRow>,
}

// ─── JobStore ───────────────────────────────────────────────────────────────

/// Durable record of every job and its state.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Creates a `Pending` job and its history row in one transaction.
    pub fn create(
        &self,
        input: JobInput,
        category: &str,
        document_size: u64,
    ) -> Result<Job, DatabaseError> {
        self.create_at(input, category, document_size, Utc::now())
    }

    /// Like [`create`](Self::create) with an explicit creation time.
    pub fn create_at(
        &self,
        input: JobInput,
        category: &str,
        document_size: u64,
        now: DateTime<Utc>,
    ) -> Result<Job, DatabaseError> {
        let job = Job {
            id: JobId::new(),
            input,
            state: JobState::Pending,
            created_at: now,
            progress: None,
        };
        let created_at = format_timestamp(now);
        let row = JobRow {
            id: job.id.to_string(),
            document_key: job.input.document.key.clone(),
            document_name: job.input.document.name.clone(),
            query: job.input.query.clone(),
            state: JobStateKind::Pending.as_str().to_string(),
            dispatch_token: None,
            attempts: 0,
            created_at: created_at.clone(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            duration_ms: None,
            progress: None,
        };
        let history = HistoryRow {
            id: Uuid::new_v4().to_string(),
            job_id: row.id.clone(),
            document_name: row.document_name.clone(),
            document_type: mime_guess::from_path(&row.document_name)
                .first()
                .map(|m| m.essence_str().to_string()),
            document_size,
            category: if category.trim().is_empty() {
                DEFAULT_CATEGORY.to_string()
            } else {
                category.to_string()
            },
            created_at,
        };

        self.db.with_transaction(|tx| {
            job_repo::insert_in(tx, &row)?;
            history_repo::insert_in(tx, &history)
        })?;

        log::debug!("Created job {} for '{}'", job.id, job.input.document.name);
        Ok(job)
    }

    pub fn get(&self, id: &JobId) -> Result<Option<Job>, DatabaseError> {
        job_repo::find_by_id(&self.db, &id.to_string())?
            .map(decode)
            .transpose()
    }

    /// Consistent snapshot of one job for clients.
    pub fn status(&self, id: &JobId) -> Result<Option<JobStatusView>, DatabaseError> {
        Ok(self.get(id)?.as_ref().map(JobStatusView::from))
    }

    /// Lists jobs newest first, returning (page, total matching).
    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<JobStatusView>, u64), DatabaseError> {
        let (rows, total) = job_repo::query(&self.db, filter)?;
        let views = decode_all(rows).iter().map(JobStatusView::from).collect();
        Ok((views, total))
    }

    pub fn list_by_state(&self, kind: JobStateKind, limit: u64) -> Result<Vec<Job>, DatabaseError> {
        Ok(decode_all(job_repo::list_by_state(
            &self.db,
            kind.as_str(),
            limit,
            0,
        )?))
    }

    pub fn count_by_state(&self, kind: JobStateKind) -> Result<u64, DatabaseError> {
        job_repo::count_by_state(&self.db, kind.as_str())
    }

    /// Writes `next` only if the job is still in `expected` under
    /// `expected_token`.
    pub fn compare_and_swap_state(
        &self,
        id: &JobId,
        expected: JobStateKind,
        expected_token: Option<&str>,
        next: &JobState,
    ) -> Result<CasOutcome, DatabaseError> {
        job_repo::compare_and_swap(
            &self.db,
            &id.to_string(),
            expected.as_str(),
            expected_token,
            &encode_state(next)?,
        )
    }

    /// Stores advisory progress. Ignored unless the job is processing
    /// under `token`.
    pub fn update_progress(
        &self,
        id: &JobId,
        token: &str,
        progress: &Progress,
    ) -> Result<bool, DatabaseError> {
        let raw = serde_json::to_string(progress)?;
        job_repo::update_progress(&self.db, &id.to_string(), token, &raw)
    }

    /// Writes the metrics record for a job that reached a terminal state.
    pub fn record_metrics(
        &self,
        job: &Job,
        document_bytes: Option<u64>,
    ) -> Result<(), DatabaseError> {
        let result = job.state.result();
        let row = MetricsRow {
            id: Uuid::new_v4().to_string(),
            job_id: job.id.to_string(),
            processing_time_ms: job
                .state
                .duration()
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default(),
            document_bytes,
            tokens_used: result.and_then(|r| r.tokens_used),
            model: result.and_then(|r| r.model.clone()),
            created_at: format_timestamp(Utc::now()),
        };
        metrics_repo::insert(&self.db, &row)
    }

    /// Terminal jobs that completed strictly before `cutoff`, oldest first.
    pub fn expired_terminal(
        &self,
        cutoff: DateTime<Utc>,
        limit: u64,
        offset: u64,
    ) -> Result<ScanPage, DatabaseError> {
        Ok(decode_page(job_repo::list_expired_terminal(
            &self.db,
            &format_timestamp(cutoff),
            limit,
            offset,
        )?))
    }

    /// Failed jobs of any age, oldest first.
    pub fn failed_jobs(&self, limit: u64, offset: u64) -> Result<ScanPage, DatabaseError> {
        Ok(decode_page(job_repo::list_by_state(
            &self.db,
            JobStateKind::Failed.as_str(),
            limit,
            offset,
        )?))
    }

    /// Pending jobs created strictly before `before`, oldest first.
    pub fn stuck_pending(
        &self,
        before: DateTime<Utc>,
        limit: u64,
        offset: u64,
    ) -> Result<ScanPage, DatabaseError> {
        Ok(decode_page(job_repo::list_stuck_pending(
            &self.db,
            &format_timestamp(before),
            limit,
            offset,
        )?))
    }

    /// Like [`stuck_pending`](Self::stuck_pending), leaving out jobs that
    /// already have a message in a `dispatch_queue` table in this database.
    pub fn orphaned_pending(
        &self,
        before: DateTime<Utc>,
        limit: u64,
        offset: u64,
    ) -> Result<ScanPage, DatabaseError> {
        Ok(decode_page(job_repo::list_orphaned_pending(
            &self.db,
            &format_timestamp(before),
            limit,
            offset,
        )?))
    }

    /// Deletes the job's history rows, metrics rows and then the job row,
    /// atomically. Returns whether the job existed.
    pub fn delete(&self, id: &JobId) -> Result<bool, DatabaseError> {
        let id = id.to_string();
        self.db.with_transaction(|tx| {
            history_repo::delete_by_job_in(tx, &id)?;
            metrics_repo::delete_by_job_in(tx, &id)?;
            job_repo::delete_in(tx, &id)
        })
    }

    pub fn history(&self, id: &JobId) -> Result<Vec<HistoryRow>, DatabaseError> {
        history_repo::find_by_job(&self.db, &id.to_string())
    }

    pub fn metrics(&self, id: &JobId) -> Result<Vec<MetricsRow>, DatabaseError> {
        metrics_repo::find_by_job(&self.db, &id.to_string())
    }

    pub fn stats(&self) -> Result<StatsSummary, DatabaseError> {
        stats_repo::summary(&self.db)
    }

    /// Every readable job and every history row.
    pub fn export(&self) -> Result<ExportData, DatabaseError> {
        let jobs = decode_all(job_repo::list_all(&self.db)?)
            .iter()
            .map(JobStatusView::from)
            .collect();
        Ok(ExportData {
            exported_at: Utc::now(),
            jobs,
            history: history_repo::list_all(&self.db)?,
        })
    }
}
