//! Router - Execution plan selection
//!
//! Classifies a query with keyword heuristics and picks how the pipeline
//! runs it. A failed classification is never fatal; the supervisor falls
//! back to the sequential plan.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AgentError, Result};
use crate::orchestrator::QueryContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPlan {
    /// The full staged pipeline
    Sequential,
    /// One fan-out over every retrieval-type role, then synthesis and citation
    ForkJoin,
    /// Per-domain sub-pipelines fused into one answer
    ScatterGather,
}

impl ExecutionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPlan::Sequential => "sequential",
            ExecutionPlan::ForkJoin => "fork_join",
            ExecutionPlan::ScatterGather => "scatter_gather",
        }
    }
}

/// Routing decision for a query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub plan: ExecutionPlan,
    /// Domain tags for scatter-gather; empty for other plans
    pub domains: Vec<String>,
    pub reason: String,
}

impl RoutingDecision {
    pub fn sequential(reason: impl Into<String>) -> Self {
        Self {
            plan: ExecutionPlan::Sequential,
            domains: Vec::new(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait QueryRouter: Send + Sync {
    async fn route(&self, query: &str, context: &QueryContext) -> Result<RoutingDecision>;
}

/// Domains in the order they are filled in when hints are sparse
pub const DEFAULT_DOMAINS: [&str; 3] = ["scientific", "technology", "news"];

const COMPARATIVE: &[&str] = &[
    "compare", "comparison", " vs ", " vs. ", "versus", "difference between", "differences between",
    "pros and cons", "trade-off", "tradeoff", "literature", "state of the art", "survey of",
];

const LOOKUP_PREFIXES: &[&str] = &["who is", "who was", "when did", "when was", "where is", "define ", "definition of"];

const DOMAIN_HINTS: &[(&str, &[&str])] = &[
    ("scientific", &["study", "studies", "research", "paper", "evidence", "scientific", "clinical", "experiment"]),
    ("technology", &["software", "framework", "library", "language", "programming", "tech", "database", "cloud"]),
    ("news", &["latest", "recent", "news", "today", "this year", "announced"]),
    ("business", &["market", "company", "companies", "pricing", "revenue", "industry"]),
];

/// Heuristic router; no model calls
#[derive(Debug, Clone)]
pub struct KeywordRouter {
    max_domains: usize,
}

impl KeywordRouter {
    pub fn new(max_domains: usize) -> Self {
        Self { max_domains: max_domains.max(1) }
    }

    fn is_comparative(&self, q: &str) -> bool {
        let padded = format!(" {} ", q);
        COMPARATIVE.iter().any(|k| padded.contains(k))
    }

    fn is_lookup(&self, q: &str) -> bool {
        q.split_whitespace().count() <= 8 && LOOKUP_PREFIXES.iter().any(|p| q.starts_with(p))
    }

    fn domains_for(&self, q: &str) -> Vec<String> {
        let mut domains: Vec<String> = DOMAIN_HINTS
            .iter()
            .filter(|(_, hints)| hints.iter().any(|h| q.contains(h)))
            .map(|(d, _)| d.to_string())
            .collect();

        let wanted = 2.min(self.max_domains);
        for d in DEFAULT_DOMAINS {
            if domains.len() >= wanted {
                break;
            }
            if !domains.iter().any(|x| x == d) {
                domains.push(d.to_string());
            }
        }
        domains.truncate(self.max_domains);
        domains
    }
}

impl Default for KeywordRouter {
    fn default() -> Self {
        Self::new(DEFAULT_DOMAINS.len())
    }
}

#[async_trait]
impl QueryRouter for KeywordRouter {
    async fn route(&self, query: &str, context: &QueryContext) -> Result<RoutingDecision> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return Err(AgentError::Planning("cannot classify an empty query".into()));
        }

        let decision = if self.is_comparative(&q) {
            RoutingDecision {
                plan: ExecutionPlan::ScatterGather,
                domains: self.domains_for(&q),
                reason: "Query is comparative or research-style".to_string(),
            }
        } else if self.is_lookup(&q) {
            RoutingDecision {
                plan: ExecutionPlan::ForkJoin,
                domains: Vec::new(),
                reason: "Short factual lookup".to_string(),
            }
        } else {
            RoutingDecision::sequential("Default research pipeline")
        };

        info!(trace_id = %context.trace_id, plan = decision.plan.as_str(), "{}", decision.reason);
        Ok(decision)
    }
}
