//! Agent Module
//!
//! The single capability every pipeline participant implements, the
//! registry that maps roles to implementations, and the agents shipped
//! with the binary.

mod types;
mod registry;
mod provider;
mod llm;
mod web_search;

pub use types::{AgentResult, AgentRole};
pub use registry::AgentRegistry;
pub use provider::{LLMProvider, OllamaProvider, OpenAICompatibleProvider, ProviderDescriptor};
pub use llm::LlmAgent;
pub use web_search::WebSearchAgent;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::orchestrator::QueryContext;

/// Capability contract for pipeline agents.
///
/// An `Err` is a fault, not a verdict: the executor converts it into a
/// failed `AgentResult`. Agents that reach a negative verdict return
/// `Ok(AgentResult::failure(..))`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &str;

    async fn execute(&self, context: &QueryContext) -> Result<AgentResult>;

    /// Stage-style entry point; `task` is shaped by the orchestrator from
    /// earlier stage outputs. Agents that only need the context keep the
    /// default.
    async fn process_task(&self, _task: &Value, context: &QueryContext) -> Result<AgentResult> {
        self.execute(context).await
    }
}
