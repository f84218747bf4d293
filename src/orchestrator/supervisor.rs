//! Supervisor
//!
//! The single entry point of the orchestration core. `process_query`
//! serves from cache when it can, otherwise allocates a budget, picks an
//! execution plan, drives the pipeline and aggregates the result. Every
//! fault is converted into a well-formed `Response`.

use futures_util::FutureExt;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

use crate::agent::{AgentRegistry, AgentRole};
use crate::error::{AgentError, Result};
use crate::orchestrator::{
    aggregation::{CacheStatus, Response, ResponseAggregator},
    budget::TokenBudgetController,
    cache::{ResponseCache, SemanticCache},
    config::PipelineConfig,
    event_bus::{EventBus, PipelineEvent},
    executor::ParallelExecutor,
    pipeline::{fork_join_stages, sequential_stages, tail_stages, PipelineEngine, StageResults},
    router::{ExecutionPlan, KeywordRouter, QueryRouter, RoutingDecision},
    scatter_gather::ScatterGatherRouter,
    QueryContext,
};
use crate::utils::approx_token_count;

pub struct Supervisor {
    registry: Arc<AgentRegistry>,
    config: Arc<PipelineConfig>,
    cache: Option<Arc<dyn ResponseCache>>,
    budget: Arc<TokenBudgetController>,
    router: Arc<dyn QueryRouter>,
    events: EventBus,
    engine: Arc<PipelineEngine>,
    scatter: ScatterGatherRouter,
    aggregator: ResponseAggregator,
}

pub struct SupervisorBuilder {
    registry: Arc<AgentRegistry>,
    config: PipelineConfig,
    cache: Option<Arc<dyn ResponseCache>>,
    budget: Option<Arc<TokenBudgetController>>,
    router: Option<Arc<dyn QueryRouter>>,
    events: Option<EventBus>,
}

impl SupervisorBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache shared with observability endpoints; its namespace must match
    /// the one derived from the configured providers
    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn budget(mut self, budget: Arc<TokenBudgetController>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn router(mut self, router: Arc<dyn QueryRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub async fn build(self) -> Result<Supervisor> {
        let mut config = self.config;
        config.validate()?;

        let registered: BTreeSet<AgentRole> = self.registry.roles().await.into_iter().collect();
        for role in config.enabled_agents.difference(&registered) {
            warn!("Role {} is enabled but has no registered agent; disabling it", role);
        }
        config.enabled_agents = config.enabled_agents.intersection(&registered).copied().collect();

        let namespace = config.cache_namespace();
        let cache: Option<Arc<dyn ResponseCache>> = if !config.cache_enabled {
            None
        } else {
            match self.cache {
                Some(cache) if cache.namespace() != namespace => {
                    return Err(AgentError::Config(format!(
                        "cache namespace '{}' does not match configured providers ('{}')",
                        cache.namespace(),
                        namespace
                    )));
                }
                Some(cache) => Some(cache),
                None => Some(Arc::new(SemanticCache::new(namespace.clone(), config.cache_ttl_secs))),
            }
        };

        let budget = self.budget
            .unwrap_or_else(|| Arc::new(TokenBudgetController::new(config.budget.clone())));
        let router = self.router
            .unwrap_or_else(|| Arc::new(KeywordRouter::new(config.max_scatter_domains)));
        let events = self.events.unwrap_or_default();

        let config = Arc::new(config);
        let executor = Arc::new(ParallelExecutor::new(config.max_concurrent_agents));
        let engine = Arc::new(
            PipelineEngine::new(self.registry.clone(), executor, config.clone()).with_events(events.clone()),
        );

        info!(
            namespace = %namespace,
            roles = config.enabled_agents.len(),
            cache = config.cache_enabled,
            "Supervisor ready"
        );

        Ok(Supervisor {
            registry: self.registry,
            scatter: ScatterGatherRouter::new(engine.clone()),
            aggregator: ResponseAggregator::new(config.min_confidence),
            config,
            cache,
            budget,
            router,
            events,
            engine,
        })
    }
}

impl Supervisor {
    /// Defaults for everything except the config
    pub async fn new(registry: Arc<AgentRegistry>, config: PipelineConfig) -> Result<Self> {
        Self::builder(registry).config(config).build().await
    }

    pub fn builder(registry: Arc<AgentRegistry>) -> SupervisorBuilder {
        SupervisorBuilder {
            registry,
            config: PipelineConfig::default(),
            cache: None,
            budget: None,
            router: None,
            events: None,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn cache(&self) -> Option<Arc<dyn ResponseCache>> {
        self.cache.clone()
    }

    pub fn budget(&self) -> Arc<TokenBudgetController> {
        self.budget.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Answer one query. Never fails: faults become a failed `Response`.
    pub async fn process_query(&self, query: &str, user_context: Map<String, Value>) -> Response {
        let started = Instant::now();
        let context = QueryContext::new(query).with_user_context(user_context);
        let trace_id = context.trace_id.clone();
        let span = tracing::info_span!("process_query", trace_id = %trace_id);

        let outcome = AssertUnwindSafe(self.run(context, started))
            .catch_unwind()
            .instrument(span)
            .await;
        let elapsed = started.elapsed().as_millis() as u64;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                error!(trace_id = %trace_id, "Query failed: {}", e);
                Response::failure(&trace_id, e.to_string(), elapsed)
            }
            Err(_) => {
                error!(trace_id = %trace_id, "Query panicked");
                Response::failure(&trace_id, "internal error: query execution panicked", elapsed)
            }
        };

        self.events.publish(PipelineEvent::QueryFinished {
            trace_id,
            success: response.success,
            confidence: response.confidence,
            latency_ms: elapsed,
        });
        response
    }

    async fn run(&self, mut context: QueryContext, started: Instant) -> Result<Response> {
        self.events.publish(PipelineEvent::QueryStarted {
            trace_id: context.trace_id.clone(),
            query: context.query().to_string(),
        });

        if let Some(mut cached) = self.lookup(&context).await {
            cached.metadata.trace_id = context.trace_id.clone();
            cached.metadata.cache_status = CacheStatus::Hit;
            cached.metadata.execution_time_ms = started.elapsed().as_millis() as u64;
            return Ok(cached);
        }

        let budget = self.budget.allocate_for_query(context.query());
        context.token_budget = budget;
        debug!(trace_id = %context.trace_id, budget, "Allocated token budget");

        let available = self.available_roles().await;
        let decision = self.plan(&context).await;
        self.events.publish(PipelineEvent::PlanSelected {
            trace_id: context.trace_id.clone(),
            plan: decision.plan.as_str().to_string(),
            reason: decision.reason.clone(),
        });

        let mut results = StageResults::new();
        match decision.plan {
            ExecutionPlan::Sequential => {
                let stages = sequential_stages(&self.config, &available);
                self.engine.run_stages(&stages, &mut context, &mut results).await;
            }
            ExecutionPlan::ForkJoin => {
                let stages = fork_join_stages(&self.config, &available);
                self.engine.run_stages(&stages, &mut context, &mut results).await;
            }
            ExecutionPlan::ScatterGather => {
                self.scatter.run(&mut context, &mut results, &decision.domains, &available).await;
                let stages = tail_stages(&self.config, &available);
                self.engine.run_stages(&stages, &mut context, &mut results).await;
            }
        }

        self.track_usage(&results);

        let mut response = self.aggregator.aggregate(&results, &context);
        response.metadata.execution_time_ms = started.elapsed().as_millis() as u64;
        response.metadata.plan = Some(decision.plan.as_str().to_string());

        info!(
            trace_id = %context.trace_id,
            success = response.success,
            confidence = response.confidence,
            stages = results.len(),
            "Query complete"
        );

        if response.success {
            self.store(&context, &response).await;
        }
        Ok(response)
    }

    /// Cache fast path; any fault is a miss
    async fn lookup(&self, context: &QueryContext) -> Option<Response> {
        let cache = self.cache.as_ref()?;
        let hit = match cache.get(context.query()).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(trace_id = %context.trace_id, "Cache read failed, treating as miss: {}", e);
                None
            }
        };

        let response = hit.and_then(|value| match serde_json::from_value::<Response>(value) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(trace_id = %context.trace_id, "Discarding unreadable cache entry: {}", e);
                None
            }
        });

        let event = if response.is_some() {
            debug!(trace_id = %context.trace_id, "Serving cached response");
            PipelineEvent::CacheHit { trace_id: context.trace_id.clone() }
        } else {
            PipelineEvent::CacheMiss { trace_id: context.trace_id.clone() }
        };
        self.events.publish(event);
        response
    }

    async fn store(&self, context: &QueryContext, response: &Response) {
        let Some(cache) = &self.cache else {
            return;
        };
        let value = match serde_json::to_value(response) {
            Ok(v) => v,
            Err(e) => {
                warn!(trace_id = %context.trace_id, "Response not cached: {}", e);
                return;
            }
        };
        if let Err(e) = cache.put(context.query(), value).await {
            warn!(trace_id = %context.trace_id, "Cache write failed: {}", e);
        }
    }

    /// Plan selection; a routing fault falls back to the sequential plan
    async fn plan(&self, context: &QueryContext) -> RoutingDecision {
        match self.router.route(context.query(), context).await {
            Ok(d) if d.plan == ExecutionPlan::ScatterGather && d.domains.is_empty() => {
                RoutingDecision::sequential("scatter-gather requested without domains")
            }
            Ok(d) => d,
            Err(e) => {
                warn!(trace_id = %context.trace_id, "Planning failed, using sequential pipeline: {}", e);
                RoutingDecision::sequential(format!("fallback after planning failure: {}", e))
            }
        }
    }

    async fn available_roles(&self) -> BTreeSet<AgentRole> {
        self.registry
            .roles()
            .await
            .into_iter()
            .filter(|r| self.config.is_enabled(*r))
            .collect()
    }

    /// Best-effort usage accounting, one consumer per role
    fn track_usage(&self, results: &StageResults) {
        for (stage, outcome) in results.iter() {
            for r in outcome.successful() {
                let consumer = r.role().map(|role| role.to_string()).unwrap_or_else(|| stage.to_string());
                let units = approx_token_count(&r.data.to_string()) as u64;
                if let Err(e) = self.budget.track_usage(&consumer, units) {
                    warn!("Usage not recorded for {}: {}", consumer, e);
                }
            }
        }
    }
}
