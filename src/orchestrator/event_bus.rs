//! Pipeline Event Bus
//!
//! Asynchronous pub/sub for pipeline telemetry. The bus is owned by the
//! process bootstrap and handed to the supervisor and the HTTP layer.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum PipelineEvent {
    QueryStarted { trace_id: String, query: String },
    CacheHit { trace_id: String },
    CacheMiss { trace_id: String },
    PlanSelected { trace_id: String, plan: String, reason: String },
    StageStarted { trace_id: String, stage: String },
    StageFinished { trace_id: String, stage: String, success: bool, latency_ms: u64 },
    QueryFinished { trace_id: String, success: bool, confidence: f64, latency_ms: u64 },
}

impl PipelineEvent {
    pub fn trace_id(&self) -> &str {
        match self {
            PipelineEvent::QueryStarted { trace_id, .. }
            | PipelineEvent::CacheHit { trace_id }
            | PipelineEvent::CacheMiss { trace_id }
            | PipelineEvent::PlanSelected { trace_id, .. }
            | PipelineEvent::StageStarted { trace_id, .. }
            | PipelineEvent::StageFinished { trace_id, .. }
            | PipelineEvent::QueryFinished { trace_id, .. } => trace_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers; having none is not an error
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
