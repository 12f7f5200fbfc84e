//! Analysis history repository: one append-only row per submitted
//! document, created together with its job.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

/// A history row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRow {
    pub id: String,
    pub job_id: String,
    pub document_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    pub document_size: u64,
    pub category: String,
    pub created_at: String,
}

impl HistoryRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            document_name: row.get("document_name")?,
            document_type: row.get("document_type")?,
            document_size: row.get("document_size")?,
            category: row.get("category")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Inserts a history row on an open connection or transaction.
pub fn insert_in(conn: &Connection, row: &HistoryRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO analysis_history (id, job_id, document_name, document_type,
         document_size, category, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            row.id,
            row.job_id,
            row.document_name,
            row.document_type,
            row.document_size,
            row.category,
            row.created_at,
        ],
    )?;
    Ok(())
}

/// Lists history rows for a job.
pub fn find_by_job(db: &Database, job_id: &str) -> Result<Vec<HistoryRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM analysis_history WHERE job_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt
            .query_map(params![job_id], HistoryRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Lists every history row, oldest first.
pub fn list_all(db: &Database) -> Result<Vec<HistoryRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM analysis_history ORDER BY created_at ASC, id ASC")?;
        let rows = stmt
            .query_map([], HistoryRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes every history row of a job. Returns the number removed.
pub fn delete_by_job_in(conn: &Connection, job_id: &str) -> Result<usize, DatabaseError> {
    let removed = conn.execute(
        "DELETE FROM analysis_history WHERE job_id = ?1",
        params![job_id],
    )?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::job_repo::{self, JobRow};

    fn db_with_job(id: &str) -> Database {
        let db = Database::open_in_memory().unwrap();
        job_repo::insert(
            &db,
            &JobRow {
                id: id.to_string(),
                document_key: "k".to_string(),
                document_name: "q3.pdf".to_string(),
                query: "summarize".to_string(),
                state: "pending".to_string(),
                dispatch_token: None,
                attempts: 0,
                created_at: "2026-01-01T00:00:00.000Z".to_string(),
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                duration_ms: None,
                progress: None,
            },
        )
        .unwrap();
        db
    }

    #[test]
    fn test_insert_find_delete() {
        let db = db_with_job("job-1");
        let row = HistoryRow {
            id: "h-1".to_string(),
            job_id: "job-1".to_string(),
            document_name: "q3.pdf".to_string(),
            document_type: Some("application/pdf".to_string()),
            document_size: 2048,
            category: "general".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
        };
        db.with_conn(|c| insert_in(c, &row)).unwrap();

        assert_eq!(find_by_job(&db, "job-1").unwrap(), vec![row.clone()]);
        assert_eq!(list_all(&db).unwrap(), vec![row]);
        assert_eq!(db.with_conn(|c| delete_by_job_in(c, "job-1")).unwrap(), 1);
        assert!(find_by_job(&db, "job-1").unwrap().is_empty());
    }

    #[test]
    fn test_job_row_cannot_be_deleted_before_history() {
        let db = db_with_job("job-2");
        let row = HistoryRow {
            id: "h-2".to_string(),
            job_id: "job-2".to_string(),
            document_name: "q3.pdf".to_string(),
            document_type: None,
            document_size: 1,
            category: "general".to_string(),
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
        };
        db.with_conn(|c| insert_in(c, &row)).unwrap();

        assert!(db.with_conn(|c| job_repo::delete_in(c, "job-2")).is_err());
    }
}
