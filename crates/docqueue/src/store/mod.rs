//! Job store: the durable record of every job.

pub mod job_store;

pub use crate::db::job_repo::{CasOutcome, JobFilter};
pub use crate::db::stats_repo::StatsSummary;
pub use job_store::{ExportData, JobStore, ScanPage, DEFAULT_CATEGORY};
