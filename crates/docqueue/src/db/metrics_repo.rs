//! Analysis metrics repository: processing measurements written when a
//! job reaches a terminal state.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

/// A metrics row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRow {
    pub id: String,
    pub job_id: String,
    pub processing_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: String,
}

impl MetricsRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            processing_time_ms: row.get("processing_time_ms")?,
            document_bytes: row.get("document_bytes")?,
            tokens_used: row.get("tokens_used")?,
            model: row.get("model")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a metrics row.
pub fn insert(db: &Database, row: &MetricsRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO analysis_metrics (id, job_id, processing_time_ms, document_bytes,
             tokens_used, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.job_id,
                row.processing_time_ms,
                row.document_bytes,
                row.tokens_used,
                row.model,
                row.created_at,
            ],
        )?;
        Ok(())
    })
}

/// Lists metrics rows for a job.
pub fn find_by_job(db: &Database, job_id: &str) -> Result<Vec<MetricsRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM analysis_metrics WHERE job_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], MetricsRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes every metrics row of a job. Returns the number removed.
pub fn delete_by_job_in(conn: &Connection, job_id: &str) -> Result<usize, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM analysis_metrics WHERE job_id = ?1",
        params![job_id],
    )?;
    Ok(removed)
}
