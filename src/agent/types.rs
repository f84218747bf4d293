use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Logical roles an agent can fill in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Retrieval,
    KnowledgeGraph,
    Browser,
    Database,
    Pdf,
    FactCheck,
    Synthesis,
    Citation,
    Review,
}

impl AgentRole {
    pub const ALL: [AgentRole; 9] = [
        AgentRole::Retrieval,
        AgentRole::KnowledgeGraph,
        AgentRole::Browser,
        AgentRole::Database,
        AgentRole::Pdf,
        AgentRole::FactCheck,
        AgentRole::Synthesis,
        AgentRole::Citation,
        AgentRole::Review,
    ];

    /// Default per-invocation timeout for this role
    pub fn default_timeout(&self) -> Duration {
        match self {
            AgentRole::Retrieval | AgentRole::KnowledgeGraph => Duration::from_secs(15),
            AgentRole::Browser | AgentRole::Database | AgentRole::Pdf => Duration::from_secs(15),
            AgentRole::FactCheck => Duration::from_secs(20),
            AgentRole::Synthesis => Duration::from_secs(30),
            AgentRole::Citation => Duration::from_secs(15),
            AgentRole::Review => Duration::from_secs(20),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Retrieval => "retrieval",
            AgentRole::KnowledgeGraph => "knowledge_graph",
            AgentRole::Browser => "browser",
            AgentRole::Database => "database",
            AgentRole::Pdf => "pdf",
            AgentRole::FactCheck => "fact_check",
            AgentRole::Synthesis => "synthesis",
            AgentRole::Citation => "citation",
            AgentRole::Review => "review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_lowercase().replace(['-', ' '], "_");
        AgentRole::ALL.iter().copied().find(|r| r.as_str() == normalized)
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform output of every agent and every internal stage.
///
/// A failed result never carries data and always reports zero confidence;
/// `execution_time_ms` is filled in on every path, timeouts included.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResult {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    pub confidence: f64,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentResult {
    /// Create a successful result; confidence is clamped into [0, 1]
    pub fn success(data: impl Into<Value>, confidence: f64) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
            confidence: clamp_confidence(confidence),
            execution_time_ms: 0,
            metadata: Map::new(),
        }
    }

    /// Create a failed result
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            confidence: 0.0,
            execution_time_ms: 0,
            metadata: Map::new(),
        }
    }

    pub fn timeout(elapsed_ms: u64) -> Self {
        Self::failure("timed out")
            .with_execution_time(elapsed_ms)
            .with_metadata("timeout", true)
    }

    /// Placeholder for a stage whose precondition did not hold
    pub fn skipped(reason: impl AsRef<str>) -> Self {
        Self::failure(format!("skipped: {}", reason.as_ref())).with_metadata("skipped", true)
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time_ms = ms;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_role(self, role: AgentRole) -> Self {
        self.with_metadata("agent_type", role.as_str())
    }

    pub fn is_timeout(&self) -> bool {
        self.metadata.get("timeout").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn is_skipped(&self) -> bool {
        self.metadata.get("skipped").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn role(&self) -> Option<AgentRole> {
        self.metadata.get("agent_type").and_then(Value::as_str).and_then(AgentRole::parse)
    }

    /// Re-establish the failure invariant for results that agents built by hand
    pub fn normalized(mut self) -> Self {
        if self.success {
            self.confidence = clamp_confidence(self.confidence);
        } else {
            self.data = Value::Null;
            self.confidence = 0.0;
            if self.error.is_none() {
                self.error = Some("agent reported failure".to_string());
            }
        }
        self
    }
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}
