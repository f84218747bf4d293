//! Query Context
//!
//! Identity and shared state of one query execution. Agents only ever see
//! an `Arc` snapshot; the pipeline engine is the single writer of
//! `metadata`, and it writes only after a stage's join point.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryContext {
    query: String,
    pub trace_id: String,
    pub user_context: Map<String, Value>,
    pub metadata: Map<String, Value>,
    /// Units of work downstream agents should stay within
    pub token_budget: u64,
}

impl QueryContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            user_context: Map::new(),
            metadata: Map::new(),
            token_budget: 0,
        }
    }

    pub fn with_user_context(mut self, user_context: Map<String, Value>) -> Self {
        self.user_context = user_context;
        self
    }

    pub fn with_token_budget(mut self, budget: u64) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Read-only copy handed to concurrently running agents
    pub fn snapshot(&self) -> Arc<QueryContext> {
        Arc::new(self.clone())
    }

    /// Child context for a sub-query; shares the trace id so logs correlate
    pub fn derive(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            trace_id: self.trace_id.clone(),
            user_context: self.user_context.clone(),
            metadata: Map::new(),
            token_budget: self.token_budget,
        }
    }

    pub fn stage_output(&self, stage: &str) -> Option<&Value> {
        self.metadata.get(stage)
    }

    pub(crate) fn merge(&mut self, key: impl Into<String>, value: Value) {
        self.metadata.insert(key.into(), value);
    }
}
