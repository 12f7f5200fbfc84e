//! Scripted engines for integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use docqueue::engine::{AnalysisEngine, AnalysisRequest, EngineContext, EngineError};
use docqueue::job::AnalysisResult;
use docqueue::StubEngine;

/// Delegates to [`StubEngine`] and counts calls.
#[derive(Default)]
pub struct CountingEngine {
    calls: AtomicUsize,
}

impl CountingEngine {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AnalysisEngine for CountingEngine {
    fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &EngineContext,
    ) -> Result<AnalysisResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        StubEngine.analyze(request, ctx)
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Always fails with the given message.
pub struct FailingEngine(pub &'static str);

impl AnalysisEngine for FailingEngine {
    fn analyze(
        &self,
        _request: &AnalysisRequest,
        _ctx: &EngineContext,
    ) -> Result<AnalysisResult, EngineError> {
        Err(EngineError::Failed(self.0.to_string()))
    }
}

/// Sleeps without ever looking at the cancellation flag.
pub struct StubbornEngine(pub Duration);

impl AnalysisEngine for StubbornEngine {
    fn analyze(
        &self,
        _request: &AnalysisRequest,
        _ctx: &EngineContext,
    ) -> Result<AnalysisResult, EngineError> {
        thread::sleep(self.0);
        Ok(AnalysisResult {
            summary: "too late".to_string(),
            details: serde_json::Value::Null,
            tokens_used: None,
            model: None,
        })
    }
}

/// Works until cancelled or until `budget` runs out.
pub struct CooperativeEngine(pub Duration);

impl AnalysisEngine for CooperativeEngine {
    fn analyze(
        &self,
        _request: &AnalysisRequest,
        ctx: &EngineContext,
    ) -> Result<AnalysisResult, EngineError> {
        let deadline = Instant::now() + self.0;
        while Instant::now() < deadline {
            ctx.checkpoint()?;
            thread::sleep(Duration::from_millis(5));
        }
        Ok(AnalysisResult {
            summary: "finished".to_string(),
            details: serde_json::Value::Null,
            tokens_used: None,
            model: None,
        })
    }
}
