//! Pipeline Engine
//!
//! Drives an ordered list of stages through the `ParallelExecutor`. A stage
//! runs only when its preconditions succeeded; otherwise it is recorded as
//! skipped so every configured stage has an entry. Outputs of successful
//! agents are merged into `QueryContext::metadata` after each join, keyed
//! by stage.

use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::agent::{AgentRegistry, AgentResult, AgentRole};
use crate::orchestrator::config::PipelineConfig;
use crate::orchestrator::event_bus::{EventBus, PipelineEvent};
use crate::orchestrator::executor::{AgentTask, ParallelExecutor};
use crate::orchestrator::QueryContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Retrieval,
    Enrichment,
    FactCheck,
    Synthesis,
    Citation,
    Review,
    ScatterGather,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Retrieval => "retrieval",
            StageId::Enrichment => "enrichment",
            StageId::FactCheck => "fact_check",
            StageId::Synthesis => "synthesis",
            StageId::Citation => "citation",
            StageId::Review => "review",
            StageId::ScatterGather => "scatter_gather",
        }
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declaration of one stage
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    pub roles: Vec<AgentRole>,
    pub timeout: Duration,
    pub required: bool,
    pub preconditions: Vec<StageId>,
    parallel: bool,
}

impl StageSpec {
    pub fn single(id: StageId, role: AgentRole, timeout: Duration) -> Self {
        Self {
            id,
            roles: vec![role],
            timeout,
            required: false,
            preconditions: Vec::new(),
            parallel: false,
        }
    }

    pub fn parallel(id: StageId, roles: Vec<AgentRole>, timeout: Duration) -> Self {
        Self {
            id,
            roles,
            timeout,
            required: false,
            preconditions: Vec::new(),
            parallel: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn after(mut self, stage: StageId) -> Self {
        self.preconditions.push(stage);
        self
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel || self.roles.len() > 1
    }
}

/// What a stage produced: one result, or one per role for parallel stages
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StageOutcome {
    Single(AgentResult),
    Parallel(Vec<AgentResult>),
}

impl StageOutcome {
    /// A parallel stage succeeds when at least one of its agents did
    pub fn succeeded(&self) -> bool {
        match self {
            StageOutcome::Single(r) => r.success,
            StageOutcome::Parallel(rs) => rs.iter().any(|r| r.success),
        }
    }

    pub fn results(&self) -> &[AgentResult] {
        match self {
            StageOutcome::Single(r) => std::slice::from_ref(r),
            StageOutcome::Parallel(rs) => rs,
        }
    }

    pub fn successful(&self) -> impl Iterator<Item = &AgentResult> {
        self.results().iter().filter(|r| r.success)
    }

    /// The single result of a sequential stage
    pub fn primary(&self) -> Option<&AgentResult> {
        match self {
            StageOutcome::Single(r) => Some(r),
            StageOutcome::Parallel(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.results().iter().all(AgentResult::is_skipped)
    }
}

/// Stage results in execution order
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageResults {
    entries: Vec<(StageId, StageOutcome)>,
}

impl StageResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: StageId, outcome: StageOutcome) {
        match self.entries.iter_mut().find(|(s, _)| *s == id) {
            Some(entry) => entry.1 = outcome,
            None => self.entries.push((id, outcome)),
        }
    }

    pub fn get(&self, id: StageId) -> Option<&StageOutcome> {
        self.entries.iter().find(|(s, _)| *s == id).map(|(_, o)| o)
    }

    pub fn contains(&self, id: StageId) -> bool {
        self.get(id).is_some()
    }

    pub fn succeeded(&self, id: StageId) -> bool {
        self.get(id).map(StageOutcome::succeeded).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(StageId, StageOutcome)> {
        self.entries.iter()
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.entries.iter().map(|(s, _)| s.as_str().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Documents listed by one agent output under `documents` or `sources`
pub(crate) fn documents_in(data: &Value) -> Vec<Value> {
    ["documents", "sources"]
        .iter()
        .filter_map(|k| data.get(*k).and_then(Value::as_array))
        .flatten()
        .cloned()
        .collect()
}

/// Union of documents, first occurrence wins
pub(crate) fn dedup_documents(docs: impl IntoIterator<Item = Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    docs.into_iter()
        .filter(|doc| seen.insert(document_key(doc)))
        .collect()
}

fn document_key(doc: &Value) -> String {
    match doc.get("url").and_then(Value::as_str) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => match (doc.get("title"), doc.get("content")) {
            (Some(t), Some(c)) => format!("{}\u{0}{}", t, c),
            _ => doc.to_string(),
        },
    }
}

/// Documents visible in the context so far
fn context_documents(context: &QueryContext) -> Vec<Value> {
    let mut docs = Vec::new();
    for stage in [StageId::Retrieval, StageId::Enrichment] {
        if let Some(Value::Object(by_role)) = context.stage_output(stage.as_str()) {
            for data in by_role.values() {
                docs.extend(documents_in(data));
            }
        }
    }
    if let Some(synthesis) = context.stage_output(StageId::Synthesis.as_str()) {
        docs.extend(documents_in(synthesis));
    }
    dedup_documents(docs)
}

/// Shape the `process_task` payload for stage-style agents
fn build_payload(stage: StageId, context: &QueryContext) -> Option<Value> {
    let synthesis = context.stage_output(StageId::Synthesis.as_str());
    let answer = synthesis.and_then(|s| s.get("answer")).cloned().unwrap_or(Value::Null);

    match stage {
        StageId::Retrieval | StageId::Enrichment | StageId::ScatterGather => None,
        StageId::FactCheck => Some(json!({
            "query": context.query(),
            "documents": context_documents(context),
        })),
        StageId::Synthesis => Some(json!({
            "query": context.query(),
            "documents": context_documents(context),
            "verification": context.stage_output(StageId::FactCheck.as_str()).cloned().unwrap_or(Value::Null),
        })),
        StageId::Citation => Some(json!({
            "query": context.query(),
            "answer": answer,
            "sources": context_documents(context),
        })),
        StageId::Review => Some(json!({
            "query": context.query(),
            "answer": answer,
            "confidence": synthesis.and_then(|s| s.get("confidence")).cloned().unwrap_or(Value::Null),
            "sources": context_documents(context),
            "citations": context
                .stage_output(StageId::Citation.as_str())
                .and_then(|c| c.get("citations"))
                .cloned()
                .unwrap_or(Value::Null),
        })),
    }
}

/// Full sequential pipeline over the roles that are both enabled and registered
pub fn sequential_stages(config: &PipelineConfig, available: &BTreeSet<AgentRole>) -> Vec<StageSpec> {
    let mut stages = Vec::new();
    stages.extend(parallel_stage(
        StageId::Retrieval,
        &[AgentRole::Retrieval, AgentRole::KnowledgeGraph],
        config,
        available,
    ).map(StageSpec::required));
    stages.extend(parallel_stage(
        StageId::Enrichment,
        &[AgentRole::Browser, AgentRole::Database, AgentRole::Pdf],
        config,
        available,
    ));
    stages.extend(single_stage(StageId::FactCheck, AgentRole::FactCheck, config, available)
        .map(|s| s.after(StageId::Retrieval)));
    stages.extend(single_stage(StageId::Synthesis, AgentRole::Synthesis, config, available)
        .map(|s| s.required().after(StageId::Retrieval)));
    stages.extend(tail_stages(config, available));
    stages
}

/// Short factual lookups: every retrieval-type role in one fan-out, then
/// synthesis and citation
pub fn fork_join_stages(config: &PipelineConfig, available: &BTreeSet<AgentRole>) -> Vec<StageSpec> {
    let mut stages = Vec::new();
    stages.extend(parallel_stage(
        StageId::Retrieval,
        &[
            AgentRole::Retrieval,
            AgentRole::KnowledgeGraph,
            AgentRole::Browser,
            AgentRole::Database,
            AgentRole::Pdf,
        ],
        config,
        available,
    ).map(StageSpec::required));
    stages.extend(single_stage(StageId::Synthesis, AgentRole::Synthesis, config, available)
        .map(|s| s.required().after(StageId::Retrieval)));
    stages.extend(single_stage(StageId::Citation, AgentRole::Citation, config, available)
        .map(|s| s.after(StageId::Synthesis)));
    stages
}

/// Retrieval and synthesis only; the per-domain sub-pipeline of scatter-gather
pub fn domain_stages(config: &PipelineConfig, available: &BTreeSet<AgentRole>) -> Vec<StageSpec> {
    let mut stages = Vec::new();
    stages.extend(parallel_stage(
        StageId::Retrieval,
        &[AgentRole::Retrieval, AgentRole::KnowledgeGraph],
        config,
        available,
    ).map(StageSpec::required));
    stages.extend(single_stage(StageId::Synthesis, AgentRole::Synthesis, config, available)
        .map(|s| s.required().after(StageId::Retrieval)));
    stages
}

/// Citation and (config-gated) review, both conditional on synthesis
pub fn tail_stages(config: &PipelineConfig, available: &BTreeSet<AgentRole>) -> Vec<StageSpec> {
    let mut stages = Vec::new();
    stages.extend(single_stage(StageId::Citation, AgentRole::Citation, config, available)
        .map(|s| s.after(StageId::Synthesis)));
    if config.enable_review {
        stages.extend(single_stage(StageId::Review, AgentRole::Review, config, available)
            .map(|s| s.after(StageId::Synthesis)));
    }
    stages
}

fn single_stage(
    id: StageId,
    role: AgentRole,
    config: &PipelineConfig,
    available: &BTreeSet<AgentRole>,
) -> Option<StageSpec> {
    available
        .contains(&role)
        .then(|| StageSpec::single(id, role, config.timeout_for(role)))
}

fn parallel_stage(
    id: StageId,
    roles: &[AgentRole],
    config: &PipelineConfig,
    available: &BTreeSet<AgentRole>,
) -> Option<StageSpec> {
    let roles: Vec<AgentRole> = roles.iter().copied().filter(|r| available.contains(r)).collect();
    let timeout = roles.iter().map(|r| config.timeout_for(*r)).max()?;
    Some(StageSpec::parallel(id, roles, timeout))
}

pub struct PipelineEngine {
    registry: Arc<AgentRegistry>,
    executor: Arc<ParallelExecutor>,
    config: Arc<PipelineConfig>,
    events: Option<EventBus>,
}

impl PipelineEngine {
    pub fn new(registry: Arc<AgentRegistry>, executor: Arc<ParallelExecutor>, config: Arc<PipelineConfig>) -> Self {
        Self {
            registry,
            executor,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `stages` in order, appending to `results`.
    ///
    /// Stages already present in `results` are treated as resolved and not
    /// run again.
    pub async fn run_stages(&self, stages: &[StageSpec], context: &mut QueryContext, results: &mut StageResults) {
        let mut aborted = false;

        for stage in stages {
            if results.contains(stage.id) {
                continue;
            }

            if aborted {
                self.record(context, results, stage.id, skipped_outcome(stage, "fail-fast abort"));
                continue;
            }

            if let Some(missing) = stage.preconditions.iter().find(|p| !results.succeeded(**p)) {
                info!(trace_id = %context.trace_id, stage = %stage.id, "Skipping stage: upstream {} failure", missing);
                let reason = format!("upstream {} failure", missing);
                self.record(context, results, stage.id, skipped_outcome(stage, &reason));
                if stage.required && self.config.fail_fast {
                    aborted = true;
                }
                continue;
            }

            let outcome = self.run_stage(stage, context, results).await;
            let succeeded = outcome.succeeded();
            self.record(context, results, stage.id, outcome);

            if !succeeded && stage.required && self.config.fail_fast {
                warn!(trace_id = %context.trace_id, stage = %stage.id, "Required stage failed, aborting pipeline");
                aborted = true;
            }
        }
    }

    async fn run_stage(&self, stage: &StageSpec, context: &QueryContext, results: &StageResults) -> StageOutcome {
        self.publish(PipelineEvent::StageStarted {
            trace_id: context.trace_id.clone(),
            stage: stage.id.as_str().to_string(),
        });
        let started = Instant::now();

        let payload = build_payload(stage.id, context);
        let mut tasks = Vec::with_capacity(stage.roles.len());
        let mut missing = Vec::new();
        for (i, role) in stage.roles.iter().enumerate() {
            match self.registry.get(*role).await {
                Some(agent) => {
                    let task = AgentTask::new(*role, agent);
                    tasks.push(match &payload {
                        Some(p) => task.with_payload(p.clone()),
                        None => task,
                    });
                }
                None => missing.push(i),
            }
        }

        let ran_results = if tasks.is_empty() {
            Vec::new()
        } else {
            self.executor.run_parallel(tasks, context.snapshot(), stage.timeout).await
        };
        let mut ran = ran_results.into_iter();

        // Roles unregistered after planning keep their slot in input order
        let mut outputs: Vec<AgentResult> = (0..stage.roles.len())
            .map(|i| {
                if missing.contains(&i) {
                    AgentResult::failure(format!("no agent registered for role '{}'", stage.roles[i]))
                        .with_role(stage.roles[i])
                } else {
                    ran.next().unwrap_or_else(|| AgentResult::failure("agent produced no result"))
                }
            })
            .collect();

        if stage.id == StageId::Synthesis {
            for output in outputs.iter_mut() {
                self.degrade_without_fact_check(output, results);
            }
        }

        let outcome = if stage.is_parallel() {
            StageOutcome::Parallel(outputs)
        } else {
            match outputs.pop() {
                Some(r) => StageOutcome::Single(r),
                None => StageOutcome::Single(AgentResult::failure("stage has no agents")),
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(
            trace_id = %context.trace_id,
            stage = %stage.id,
            success = outcome.succeeded(),
            latency_ms,
            "Stage finished"
        );
        self.publish(PipelineEvent::StageFinished {
            trace_id: context.trace_id.clone(),
            stage: stage.id.as_str().to_string(),
            success: outcome.succeeded(),
            latency_ms,
        });
        outcome
    }

    /// Synthesis confidence is penalized when a planned fact-check did not succeed
    fn degrade_without_fact_check(&self, output: &mut AgentResult, results: &StageResults) {
        let fact_check_failed = results
            .get(StageId::FactCheck)
            .map(|o| !o.succeeded())
            .unwrap_or(false);
        if output.success && fact_check_failed {
            output.confidence *= self.config.fact_check_penalty;
            output.metadata.insert("confidence_degraded".into(), Value::Bool(true));
            if let Some(obj) = output.data.as_object_mut() {
                if obj.contains_key("confidence") {
                    obj.insert("confidence".into(), json!(output.confidence));
                }
            }
        }
    }

    /// Record a stage outcome and merge its successful outputs forward
    pub(crate) fn record(&self, context: &mut QueryContext, results: &mut StageResults, id: StageId, outcome: StageOutcome) {
        match &outcome {
            StageOutcome::Single(r) if r.success => context.merge(id.as_str(), r.data.clone()),
            StageOutcome::Single(_) => {}
            StageOutcome::Parallel(rs) => {
                let by_role: Map<String, Value> = rs
                    .iter()
                    .filter(|r| r.success)
                    .filter_map(|r| r.role().map(|role| (role.as_str().to_string(), r.data.clone())))
                    .collect();
                if !by_role.is_empty() {
                    context.merge(id.as_str(), Value::Object(by_role));
                }
            }
        }
        debug!(trace_id = %context.trace_id, stage = %id, "Recorded stage outcome");
        results.insert(id, outcome);
    }

    fn publish(&self, event: PipelineEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }
}

fn skipped_outcome(stage: &StageSpec, reason: &str) -> StageOutcome {
    let skipped: Vec<AgentResult> = stage
        .roles
        .iter()
        .map(|role| AgentResult::skipped(reason).with_role(*role))
        .collect();
    if stage.is_parallel() {
        StageOutcome::Parallel(skipped)
    } else {
        StageOutcome::Single(
            skipped.into_iter().next().unwrap_or_else(|| AgentResult::skipped(reason)),
        )
    }
}
