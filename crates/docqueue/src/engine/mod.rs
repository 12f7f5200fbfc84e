//! Analysis engine interface.
//!
//! The executor runs [`AnalysisEngine::analyze`] on its own thread. The
//! engine may report advisory progress and should poll
//! [`EngineContext::is_cancelled`] between steps; once the soft time limit
//! passes the flag is set and the engine is expected to return
//! [`EngineError::Cancelled`].

pub mod stub;

pub use stub::StubEngine;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::job::{AnalysisResult, DocumentRef, JobId};
use crate::worker::progress::{NoopProgress, ProgressReporter};

/// Errors an engine can return.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("{0}")]
    Failed(String),

    #[error("analysis cancelled")]
    Cancelled,
}

/// What the engine is asked to analyze.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub job_id: JobId,
    pub document: DocumentRef,
    pub content: Vec<u8>,
    pub query: String,
}

/// Per-call handle for progress reporting and cooperative cancellation.
#[derive(Clone)]
pub struct EngineContext {
    reporter: Arc<dyn ProgressReporter>,
    cancelled: Arc<AtomicBool>,
}

impl EngineContext {
    pub fn new(reporter: Arc<dyn ProgressReporter>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            reporter,
            cancelled,
        }
    }

    /// A context that drops progress and is never cancelled.
    pub fn detached() -> Self {
        Self::new(Arc::new(NoopProgress), Arc::new(AtomicBool::new(false)))
    }

    pub fn report(&self, percent: u8, message: &str) {
        self.reporter.report(percent, message);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        if self.is_cancelled() {
            Err(EngineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Produces an analysis for a document and query.
pub trait AnalysisEngine: Send + Sync {
    fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &EngineContext,
    ) -> Result<AnalysisResult, EngineError>;

    /// Model name recorded with metrics when the result does not name one.
    fn name(&self) -> &str {
        "engine"
    }
}
