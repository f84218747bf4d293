//! Scatter-Gather Router
//!
//! Splits a comparative query into domain-scoped sub-queries, runs a
//! retrieval + synthesis sub-pipeline for each concurrently and fuses the
//! answers. Fused confidence is the mean over successful domains only.

use futures_util::future::join_all;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::agent::{AgentResult, AgentRole};
use crate::orchestrator::pipeline::{
    dedup_documents, documents_in, domain_stages, PipelineEngine, StageId, StageOutcome, StageResults,
};
use crate::orchestrator::QueryContext;

pub struct ScatterGatherRouter {
    engine: Arc<PipelineEngine>,
}

impl ScatterGatherRouter {
    pub fn new(engine: Arc<PipelineEngine>) -> Self {
        Self { engine }
    }

    /// One `(domain, sub-query)` pair per domain, capped by configuration
    pub fn decompose(&self, query: &str, domains: &[String]) -> Vec<(String, String)> {
        domains
            .iter()
            .take(self.engine.config().max_scatter_domains.max(1))
            .map(|d| (d.clone(), format!("{} (focus: {} sources)", query, d)))
            .collect()
    }

    /// Run every domain sub-pipeline; one result per domain, in domain order
    pub async fn gather(
        &self,
        context: &QueryContext,
        subqueries: &[(String, String)],
        available: &BTreeSet<AgentRole>,
    ) -> Vec<AgentResult> {
        let stages = domain_stages(self.engine.config(), available);
        let limit = self.engine.config().timeouts.domain();

        let runs = subqueries.iter().map(|(domain, subquery)| {
            let stages = &stages;
            async move {
                let mut sub = context.derive(subquery.clone());
                sub.user_context.insert("domain".into(), json!(domain));
                let mut results = StageResults::new();
                let started = Instant::now();

                // On timeout the sub-pipeline is dropped, which aborts its in-flight agent tasks
                let finished = tokio::time::timeout(limit, self.engine.run_stages(stages, &mut sub, &mut results)).await;
                let elapsed = started.elapsed().as_millis() as u64;
                let result = match finished {
                    Ok(()) => domain_result(domain, &results),
                    Err(_) => {
                        warn!(trace_id = %context.trace_id, domain = %domain, "Domain sub-pipeline timed out");
                        AgentResult::timeout(elapsed)
                    }
                };
                result.with_execution_time(elapsed).with_metadata("domain", domain.as_str())
            }
        });

        join_all(runs).await
    }

    /// Decompose, gather and record both the per-domain results and the
    /// fused answer (as the synthesis stage) into `results`
    pub async fn run(
        &self,
        context: &mut QueryContext,
        results: &mut StageResults,
        domains: &[String],
        available: &BTreeSet<AgentRole>,
    ) {
        let subqueries = self.decompose(context.query(), domains);
        info!(trace_id = %context.trace_id, domains = subqueries.len(), "Scattering query");

        let gathered = self.gather(context, &subqueries, available).await;
        let fused = fuse(&gathered);

        if gathered.iter().any(|r| r.success) {
            self.engine.record(context, results, StageId::ScatterGather, StageOutcome::Parallel(gathered));
            self.engine.record(context, results, StageId::Synthesis, StageOutcome::Single(fused.with_role(AgentRole::Synthesis)));
        } else {
            self.engine.record(context, results, StageId::ScatterGather, StageOutcome::Single(fused));
            self.engine.record(
                context,
                results,
                StageId::Synthesis,
                StageOutcome::Single(AgentResult::skipped("upstream scatter_gather failure").with_role(AgentRole::Synthesis)),
            );
        }
    }
}

/// Summarize one domain's sub-pipeline as a single result
fn domain_result(domain: &str, results: &StageResults) -> AgentResult {
    let synthesis = results.get(StageId::Synthesis).and_then(StageOutcome::primary);
    match synthesis {
        Some(s) if s.success => {
            let mut sources: Vec<Value> = results
                .get(StageId::Retrieval)
                .map(|o| o.successful().flat_map(|r| documents_in(&r.data)).collect())
                .unwrap_or_default();
            sources.extend(documents_in(&s.data));
            AgentResult::success(
                json!({
                    "domain": domain,
                    "answer": s.data.get("answer").cloned().unwrap_or(Value::Null),
                    "sources": dedup_documents(sources),
                }),
                s.confidence,
            )
        }
        _ => {
            let cause = results
                .iter()
                .flat_map(|(_, o)| o.results())
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "no synthesis produced".to_string());
            AgentResult::failure(format!("domain {}: {}", domain, cause))
        }
    }
}

/// Fuse per-domain results into one answer.
///
/// Failed domains do not pull the mean down. When every domain failed the
/// result is a single failure.
pub fn fuse(domain_results: &[AgentResult]) -> AgentResult {
    let successes: Vec<&AgentResult> = domain_results.iter().filter(|r| r.success).collect();
    if successes.is_empty() {
        let reasons: Vec<String> = domain_results.iter().filter_map(|r| r.error.clone()).collect();
        return AgentResult::failure(format!(
            "all {} domains failed: {}",
            domain_results.len(),
            reasons.join("; ")
        ));
    }

    let confidence = successes.iter().map(|r| r.confidence).sum::<f64>() / successes.len() as f64;
    let sources = dedup_documents(successes.iter().flat_map(|r| documents_in(&r.data)));
    let sections: Vec<String> = successes
        .iter()
        .filter_map(|r| {
            let domain = r.data.get("domain").and_then(Value::as_str).unwrap_or("general");
            r.data
                .get("answer")
                .and_then(Value::as_str)
                .filter(|a| !a.trim().is_empty())
                .map(|a| format!("[{}] {}", domain, a.trim()))
        })
        .collect();
    let domains: Vec<Value> = successes.iter().filter_map(|r| r.data.get("domain").cloned()).collect();

    AgentResult::success(
        json!({
            "answer": sections.join("\n\n"),
            "confidence": confidence,
            "sources": sources,
            "domains": domains,
        }),
        confidence,
    )
    .with_execution_time(domain_results.iter().map(|r| r.execution_time_ms).max().unwrap_or(0))
}
