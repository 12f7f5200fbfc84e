//! Job repository: row-level operations on the `jobs` table.
//!
//! Rows are stored with string-typed columns; decoding into the
//! domain `Job` happens in the store layer.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub document_key: String,
    pub document_name: String,
    pub query: String,
    pub state: String,
    pub dispatch_token: Option<String>,
    pub attempts: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    /// JSON-encoded analysis result.
    pub result: Option<String>,
    /// JSON-encoded failure cause.
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    /// JSON-encoded advisory progress.
    pub progress: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            document_key: row.get("document_key")?,
            document_name: row.get("document_name")?,
            query: row.get("query")?,
            state: row.get("state")?,
            dispatch_token: row.get("dispatch_token")?,
            attempts: row.get("attempts")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            result: row.get("result")?,
            error: row.get("error")?,
            duration_ms: row.get("duration_ms")?,
            progress: row.get("progress")?,
        })
    }
}

/// The state-machine columns written by a compare-and-swap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateColumns {
    pub state: String,
    pub dispatch_token: Option<String>,
    pub attempts: u32,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
}

/// Outcome of a conditional state write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The row matched the expected state and token and was updated.
    Applied,
    /// The row exists but its state or token changed underneath the caller.
    Conflict,
    /// No row with that id.
    NotFound,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub state: Option<String>,
    pub from_date: Option<String>,
    pub to_date: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Inserts a new job row on an open connection or transaction.
pub fn insert_in(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, document_key, document_name, query, state, dispatch_token,
         attempts, created_at, started_at, completed_at, result, error, duration_ms, progress)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            job.id,
            job.document_key,
            job.document_name,
            job.query,
            job.state,
            job.dispatch_token,
            job.attempts,
            job.created_at,
            job.started_at,
            job.completed_at,
            job.result,
            job.error,
            job.duration_ms,
            job.progress,
        ],
    )?;
    Ok(())
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_in(conn, job))
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM jobs WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Writes `next` only if the row still has `expected_state` and
/// `expected_token`. A `None` token matches a NULL column.
pub fn compare_and_swap(
    db: &Database,
    id: &str,
    expected_state: &str,
    expected_token: Option<&str>,
    next: &StateColumns,
) -> Result<CasOutcome, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET state = ?4, dispatch_token = ?5, attempts = ?6, started_at = ?7,
             completed_at = ?8, result = ?9, error = ?10, duration_ms = ?11
             WHERE id = ?1 AND state = ?2 AND dispatch_token IS ?3",
            params![
                id,
                expected_state,
                expected_token,
                next.state,
                next.dispatch_token,
                next.attempts,
                next.started_at,
                next.completed_at,
                next.result,
                next.error,
                next.duration_ms,
            ],
        )?;
        if changed > 0 {
            return Ok(CasOutcome::Applied);
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM jobs WHERE id = ?1)",
            params![id],
            |r| r.get(0),
        )?;
        Ok(if exists {
            CasOutcome::Conflict
        } else {
            CasOutcome::NotFound
        })
    })
}

/// Stores advisory progress for a job that is still processing under
/// `token`. Returns false when the job moved on (or never matched).
pub fn update_progress(
    db: &Database,
    id: &str,
    token: &str,
    progress: &str,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET progress = ?3
             WHERE id = ?1 AND state = 'processing' AND dispatch_token = ?2",
            params![id, token, progress],
        )?;
        Ok(changed > 0)
    })
}

/// Lists jobs in a given state, oldest first.
pub fn list_by_state(
    db: &Database,
    state: &str,
    limit: u64,
    offset: u64,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE state = ?1
             ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![state, limit as i64, offset as i64],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists terminal jobs that completed strictly before `cutoff`.
pub fn list_expired_terminal(
    db: &Database,
    cutoff: &str,
    limit: u64,
    offset: u64,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE state IN ('completed', 'failed') AND completed_at < ?1
             ORDER BY completed_at ASC, id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![cutoff, limit as i64, offset as i64],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists pending jobs created strictly before `before`.
pub fn list_stuck_pending(
    db: &Database,
    before: &str,
    limit: u64,
    offset: u64,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE state = 'pending' AND created_at < ?1
             ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![before, limit as i64, offset as i64],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists pending jobs created strictly before `before` that have no
/// message in `dispatch_queue`. Only meaningful when the queue table lives
/// in this database.
pub fn list_orphaned_pending(
    db: &Database,
    before: &str,
    limit: u64,
    offset: u64,
) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs
             WHERE state = 'pending' AND created_at < ?1
               AND NOT EXISTS (SELECT 1 FROM dispatch_queue q WHERE q.job_id = jobs.id)
             ORDER BY created_at ASC, id ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(
                params![before, limit as i64, offset as i64],
                JobRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists every job, oldest first.
pub fn list_all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes a job row. Returns whether a row was removed.
pub fn delete_in(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

/// Queries jobs with filters, returning (rows, total_count).
pub fn query(db: &Database, filter: &JobFilter) -> Result<(Vec<JobRow>, u64), DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(ref state) = filter.state {
            conditions.push(format!("state = ?{}", param_values.len() + 1));
            param_values.push(Box::new(state.clone()));
        }
        if let Some(ref from_date) = filter.from_date {
            conditions.push(format!("created_at >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from_date.clone()));
        }
        if let Some(ref to_date) = filter.to_date {
            conditions.push(format!("created_at <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to_date.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let total: u64 = conn.query_row(&count_sql, params_ref.as_slice(), |r| r.get(0))?;

        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;
        param_values.push(Box::new(limit));
        param_values.push(Box::new(offset));
        let query_sql = format!(
            "SELECT * FROM jobs {} ORDER BY created_at DESC LIMIT ?{} OFFSET ?{}",
            where_clause,
            param_values.len() - 1,
            param_values.len()
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&query_sql)?;
        let rows: Vec<JobRow> = stmt
            .query_map(params_ref.as_slice(), JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((rows, total))
    })
}

/// Counts jobs in the given state.
pub fn count_by_state(db: &Database, state: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE state = ?1",
            params![state],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str, created_at: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            document_key: format!("{}-report.pdf", id),
            document_name: "report.pdf".to_string(),
            query: "summarize".to_string(),
            state: "pending".to_string(),
            dispatch_token: None,
            attempts: 0,
            created_at: created_at.to_string(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            duration_ms: None,
            progress: None,
        }
    }

    fn processing(token: &str) -> StateColumns {
        StateColumns {
            state: "processing".to_string(),
            dispatch_token: Some(token.to_string()),
            attempts: 1,
            started_at: Some("2026-01-01T00:00:01.000Z".to_string()),
            ..Default::default()
        }
    }

    fn completed_at(ts: &str) -> StateColumns {
        StateColumns {
            state: "completed".to_string(),
            dispatch_token: Some("t1".to_string()),
            attempts: 1,
            started_at: Some("2026-01-01T00:00:01.000Z".to_string()),
            completed_at: Some(ts.to_string()),
            result: Some(r#"{"summary":"ok"}"#.to_string()),
            error: None,
            duration_ms: Some(1000),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1", "2026-01-01T00:00:00.000Z")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.document_name, "report.pdf");
        assert_eq!(found.state, "pending");
        assert_eq!(found.attempts, 0);
        assert!(found.dispatch_token.is_none());
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nonexistent").unwrap().is_none());
    }

    #[test]
    fn test_cas_applies_on_match() {
        let db = test_db();
        insert(&db, &sample_job("job-2", "2026-01-01T00:00:00.000Z")).unwrap();

        let outcome = compare_and_swap(&db, "job-2", "pending", None, &processing("t1")).unwrap();
        assert_eq!(outcome, CasOutcome::Applied);

        let found = find_by_id(&db, "job-2").unwrap().unwrap();
        assert_eq!(found.state, "processing");
        assert_eq!(found.dispatch_token.as_deref(), Some("t1"));
    }

    #[test]
    fn test_cas_conflict_on_stale_state() {
        let db = test_db();
        insert(&db, &sample_job("job-3", "2026-01-01T00:00:00.000Z")).unwrap();
        compare_and_swap(&db, "job-3", "pending", None, &processing("t1")).unwrap();

        let second = compare_and_swap(&db, "job-3", "pending", None, &processing("t2")).unwrap();
        assert_eq!(second, CasOutcome::Conflict);

        let found = find_by_id(&db, "job-3").unwrap().unwrap();
        assert_eq!(found.dispatch_token.as_deref(), Some("t1"));
    }

    #[test]
    fn test_cas_conflict_on_stale_token() {
        let db = test_db();
        insert(&db, &sample_job("job-4", "2026-01-01T00:00:00.000Z")).unwrap();
        compare_and_swap(&db, "job-4", "pending", None, &processing("t1")).unwrap();

        let outcome = compare_and_swap(
            &db,
            "job-4",
            "processing",
            Some("other"),
            &completed_at("2026-01-01T00:00:02.000Z"),
        )
        .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
    }

    #[test]
    fn test_cas_not_found() {
        let db = test_db();
        let outcome = compare_and_swap(&db, "missing", "pending", None, &processing("t1")).unwrap();
        assert_eq!(outcome, CasOutcome::NotFound);
    }

    #[test]
    fn test_progress_only_while_processing_under_token() {
        let db = test_db();
        insert(&db, &sample_job("job-5", "2026-01-01T00:00:00.000Z")).unwrap();
        assert!(!update_progress(&db, "job-5", "t1", "{}").unwrap());

        compare_and_swap(&db, "job-5", "pending", None, &processing("t1")).unwrap();
        assert!(!update_progress(&db, "job-5", "t2", "{}").unwrap());
        assert!(update_progress(&db, "job-5", "t1", r#"{"percent":50}"#).unwrap());

        compare_and_swap(
            &db,
            "job-5",
            "processing",
            Some("t1"),
            &completed_at("2026-01-01T00:00:02.000Z"),
        )
        .unwrap();
        assert!(!update_progress(&db, "job-5", "t1", r#"{"percent":90}"#).unwrap());

        let found = find_by_id(&db, "job-5").unwrap().unwrap();
        assert_eq!(found.progress.as_deref(), Some(r#"{"percent":50}"#));
    }

    #[test]
    fn test_list_expired_terminal_is_strict() {
        let db = test_db();
        insert(&db, &sample_job("job-6", "2026-01-01T00:00:00.000Z")).unwrap();
        compare_and_swap(&db, "job-6", "pending", None, &processing("t1")).unwrap();
        compare_and_swap(
            &db,
            "job-6",
            "processing",
            Some("t1"),
            &completed_at("2026-01-01T00:00:02.000Z"),
        )
        .unwrap();

        let at_cutoff = list_expired_terminal(&db, "2026-01-01T00:00:02.000Z", 10, 0).unwrap();
        assert!(at_cutoff.is_empty());
        let after = list_expired_terminal(&db, "2026-01-01T00:00:02.001Z", 10, 0).unwrap();
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn test_list_stuck_pending() {
        let db = test_db();
        insert(&db, &sample_job("old", "2026-01-01T00:00:00.000Z")).unwrap();
        insert(&db, &sample_job("new", "2026-01-01T01:00:00.000Z")).unwrap();

        let stuck = list_stuck_pending(&db, "2026-01-01T00:30:00.000Z", 10, 0).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "old");
    }

    #[test]
    fn test_list_orphaned_pending_skips_queued_jobs() {
        let db = test_db();
        insert(&db, &sample_job("queued", "2026-01-01T00:00:00.000Z")).unwrap();
        insert(&db, &sample_job("orphan", "2026-01-01T00:00:01.000Z")).unwrap();
        crate::db::queue_repo::insert(&db, "m1", "queued", "2026-01-01T00:00:00.000Z").unwrap();

        let before = "2026-01-01T00:30:00.000Z";
        assert_eq!(list_stuck_pending(&db, before, 1, 0).unwrap()[0].id, "queued");
        let orphans = list_orphaned_pending(&db, before, 1, 0).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, "orphan");
        assert!(list_orphaned_pending(&db, before, 1, 1).unwrap().is_empty());
    }

    #[test]
    fn test_query_with_filter() {
        let db = test_db();
        for i in 0..5 {
            let job = sample_job(&format!("q-{}", i), &format!("2026-01-01T00:00:0{}.000Z", i));
            insert(&db, &job).unwrap();
        }
        compare_and_swap(&db, "q-0", "pending", None, &processing("t1")).unwrap();

        let (rows, total) = query(&db, &JobFilter::default()).unwrap();
        assert_eq!(total, 5);
        assert_eq!(rows[0].id, "q-4");

        let filter = JobFilter {
            state: Some("pending".to_string()),
            limit: Some(2),
            ..Default::default()
        };
        let (rows, total) = query(&db, &filter).unwrap();
        assert_eq!(total, 4);
        assert_eq!(rows.len(), 2);

        assert_eq!(count_by_state(&db, "processing").unwrap(), 1);
    }

    #[test]
    fn test_delete() {
        let db = test_db();
        insert(&db, &sample_job("gone", "2026-01-01T00:00:00.000Z")).unwrap();
        assert!(db.with_conn(|c| delete_in(c, "gone")).unwrap());
        assert!(!db.with_conn(|c| delete_in(c, "gone")).unwrap());
    }
}
