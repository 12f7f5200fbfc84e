//! Built-in engine that needs no model.
//!
//! Produces document statistics and the lines that mention the query's
//! terms. Used when no real engine is wired in.

use std::collections::BTreeSet;

use serde_json::json;

use super::{AnalysisEngine, AnalysisRequest, EngineContext, EngineError};
use crate::job::AnalysisResult;

/// Model name reported by [`StubEngine`].
pub const STUB_MODEL: &str = "docqueue-stub";

/// Maximum number of matching lines kept in the result.
const MAX_EXCERPTS: usize = 5;

pub struct StubEngine;

fn query_terms(query: &str) -> BTreeSet<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

impl AnalysisEngine for StubEngine {
    fn analyze(
        &self,
        request: &AnalysisRequest,
        ctx: &EngineContext,
    ) -> Result<AnalysisResult, EngineError> {
        if request.content.is_empty() {
            return Err(EngineError::Failed("document is empty".to_string()));
        }

        ctx.report(10, "Reading document");
        let text = String::from_utf8_lossy(&request.content);
        ctx.checkpoint()?;

        ctx.report(50, "Scanning for query terms");
        let terms = query_terms(&request.query);
        let lines = text.lines().count();
        let words = text.split_whitespace().count();
        let excerpts: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| {
                let lower = line.to_lowercase();
                terms.iter().any(|t| lower.contains(t.as_str()))
            })
            .take(MAX_EXCERPTS)
            .collect();
        ctx.checkpoint()?;

        ctx.report(90, "Summarizing");
        let summary = format!(
            "{} has {} lines and {} words; {} line(s) mention the query",
            request.document.name,
            lines,
            words,
            excerpts.len()
        );
        let tokens = (words + request.query.split_whitespace().count()) as u64;

        Ok(AnalysisResult {
            summary,
            details: json!({
                "query": request.query,
                "bytes": request.content.len(),
                "lines": lines,
                "words": words,
                "terms": terms,
                "excerpts": excerpts,
            }),
            tokens_used: Some(tokens),
            model: Some(STUB_MODEL.to_string()),
        })
    }

    fn name(&self) -> &str {
        STUB_MODEL
    }
}
