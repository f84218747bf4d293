//! Response Aggregation
//!
//! Collapses the stage results of one query into the caller-facing
//! `Response`. Errors and failed agents are collected for observability
//! only; success is decided by the final answer and its confidence.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentResult;
use crate::orchestrator::pipeline::{dedup_documents, documents_in, StageId, StageOutcome, StageResults};
use crate::orchestrator::QueryContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    #[default]
    Miss,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResponseMetadata {
    pub trace_id: String,
    pub execution_time_ms: u64,
    pub cache_status: CacheStatus,
    pub pipeline_stages: Vec<String>,
    pub errors: Vec<String>,
    #[serde(default)]
    pub failed_agents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub success: bool,
    pub answer: String,
    pub confidence: f64,
    pub sources: Vec<Value>,
    pub citations: Vec<Value>,
    pub metadata: ResponseMetadata,
}

impl Response {
    /// Well-formed failure for faults caught at the query boundary
    pub fn failure(trace_id: impl Into<String>, error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            answer: String::new(),
            confidence: 0.0,
            sources: Vec::new(),
            citations: Vec::new(),
            metadata: ResponseMetadata {
                trace_id: trace_id.into(),
                execution_time_ms,
                errors: vec![error.into()],
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseAggregator {
    min_confidence: f64,
}

impl ResponseAggregator {
    pub fn new(min_confidence: f64) -> Self {
        Self { min_confidence }
    }

    /// Build the response; `execution_time_ms` and `cache_status` are left
    /// for the caller to fill in.
    pub fn aggregate(&self, results: &StageResults, context: &QueryContext) -> Response {
        let (answer, confidence) = final_answer(results);
        let answer = answer.unwrap_or_default();

        let sources = dedup_documents(
            results
                .iter()
                .flat_map(|(_, outcome)| outcome.successful())
                .flat_map(|r| documents_in(&r.data)),
        );

        let citations = results
            .get(StageId::Citation)
            .and_then(StageOutcome::primary)
            .filter(|r| r.success)
            .map(|r| citations_in(&r.data))
            .unwrap_or_default();

        let mut errors = Vec::new();
        let mut failed_agents = Vec::new();
        for (stage, outcome) in results.iter() {
            for r in outcome.results().iter().filter(|r| !r.success) {
                let message = r.error.as_deref().unwrap_or("unknown error");
                errors.push(format!("{}: {}", stage, message));
                failed_agents.push(agent_label(*stage, r));
            }
        }

        let success = !answer.trim().is_empty() && confidence >= self.min_confidence;

        Response {
            success,
            answer,
            confidence,
            sources,
            citations,
            metadata: ResponseMetadata {
                trace_id: context.trace_id.clone(),
                execution_time_ms: 0,
                cache_status: CacheStatus::Miss,
                pipeline_stages: results.stage_names(),
                errors,
                failed_agents,
                plan: None,
            },
        }
    }
}

impl Default for ResponseAggregator {
    fn default() -> Self {
        Self::new(0.5)
    }
}

/// Reviewed answer if review succeeded with one, otherwise synthesis
fn final_answer(results: &StageResults) -> (Option<String>, f64) {
    let synthesis = results
        .get(StageId::Synthesis)
        .and_then(StageOutcome::primary)
        .filter(|r| r.success);
    let Some(synthesis) = synthesis else {
        return (None, 0.0);
    };

    let mut answer = non_empty_answer(&synthesis.data);
    let mut confidence = synthesis.confidence;

    if let Some(review) = results
        .get(StageId::Review)
        .and_then(StageOutcome::primary)
        .filter(|r| r.success)
    {
        if let Some(rewritten) = non_empty_answer(&review.data) {
            answer = Some(rewritten);
        }
        if let Some(c) = review.data.get("confidence").and_then(Value::as_f64) {
            confidence = c.clamp(0.0, 1.0);
        }
    }

    (answer, confidence)
}

fn non_empty_answer(data: &Value) -> Option<String> {
    data.get("answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
}

fn citations_in(data: &Value) -> Vec<Value> {
    match data {
        Value::Array(items) => items.clone(),
        _ => data
            .get("citations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
    }
}

fn agent_label(stage: StageId, r: &AgentResult) -> String {
    if let Some(role) = r.role() {
        return role.to_string();
    }
    match r.metadata.get("domain").and_then(Value::as_str) {
        Some(domain) => format!("{}:{}", stage, domain),
        None => stage.to_string(),
    }
}
