//! Orchestrator Module
//!
//! Coordinates agents into a single answer: plan selection, staged
//! execution with fork-join fan-out, scatter-gather fusion, caching and
//! budget accounting.

pub mod aggregation;
pub mod budget;
pub mod cache;
pub mod config;
pub mod context;
pub mod event_bus;
pub mod executor;
pub mod pipeline;
pub mod router;
pub mod scatter_gather;
pub mod supervisor;

pub use aggregation::{CacheStatus, Response, ResponseAggregator, ResponseMetadata};
pub use budget::{TokenBudgetController, UsageReport};
pub use cache::{spawn_cache_pruner, CacheEntry, CacheStats, ResponseCache, SemanticCache};
pub use config::{BudgetConfig, ConfigManager, PipelineConfig, StageTimeouts};
pub use context::QueryContext;
pub use event_bus::{EventBus, PipelineEvent};
pub use executor::{AgentTask, ParallelExecutor};
pub use pipeline::{PipelineEngine, StageId, StageOutcome, StageResults, StageSpec};
pub use router::{ExecutionPlan, KeywordRouter, QueryRouter, RoutingDecision};
pub use scatter_gather::ScatterGatherRouter;
pub use supervisor::{Supervisor, SupervisorBuilder};
