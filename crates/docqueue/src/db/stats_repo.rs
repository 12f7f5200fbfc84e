//! Aggregate statistics across jobs, history and metrics.

use serde::Serialize;

use super::{Database, DatabaseError};

/// Job counts and totals at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_jobs: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Mean duration of terminal jobs, if any finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_ms: Option<f64>,
    pub history_records: u64,
    pub metrics_records: u64,
    pub total_tokens: u64,
}

/// Returns the current summary.
pub fn summary(db: &Database) -> Result<StatsSummary, DatabaseError> {
    db.with_conn(|conn| {
        let mut summary = StatsSummary::default();

        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        for (state, count) in counts {
            summary.total_jobs += count;
            match state.as_str() {
                "pending" => summary.pending = count,
                "processing" => summary.processing = count,
                "completed" => summary.completed = count,
                "failed" => summary.failed = count,
                other => log::warn!("Ignoring unknown job state '{}' in stats", other),
            }
        }

        summary.avg_duration_ms = conn.query_row(
            "SELECT AVG(duration_ms) FROM jobs WHERE duration_ms IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        summary.history_records =
            conn.query_row("SELECT COUNT(*) FROM analysis_history", [], |r| r.get(0))?;
        let (metrics_records, total_tokens): (u64, u64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(tokens_used), 0) FROM analysis_metrics",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        summary.metrics_records = metrics_records;
        summary.total_tokens = total_tokens;

        Ok(summary)
    })
}
