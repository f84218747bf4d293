//! LLM-backed Agent
//!
//! Fills any role by prompting a provider with role-specific instructions
//! and the task payload the orchestrator shaped from earlier stages.
//! Replies are expected to be a JSON object; plain text is accepted for
//! synthesis and review.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use super::{Agent, AgentResult, AgentRole, LLMProvider};
use crate::error::{AgentError, Result};
use crate::orchestrator::QueryContext;
use crate::utils::truncate::{preview, truncate_text, TruncationPolicy};

const DEFAULT_CONFIDENCE: f64 = 0.7;
const MAX_PAYLOAD_TOKENS: u64 = 3000;

pub struct LlmAgent {
    role: AgentRole,
    name: String,
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl LlmAgent {
    pub fn new(role: AgentRole, provider: Arc<dyn LLMProvider>) -> Self {
        let model = provider.descriptor().model;
        Self {
            role,
            name: format!("llm-{}", role),
            provider,
            model,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn instructions(&self) -> &'static str {
        match self.role {
            AgentRole::Synthesis =>
                "You are a synthesis agent. Write a concise, accurate answer to QUERY using only the \
                 documents in INPUT. Prefer verified claims. Reply with JSON: \
                 {\"answer\": string, \"confidence\": number between 0 and 1}.",
            AgentRole::FactCheck =>
                "You are a fact-checker. For each document in INPUT decide whether its claim is \
                 supported. Reply with JSON: {\"verified\": [index...], \"unverified\": [index...], \
                 \"confidence\": number between 0 and 1}.",
            AgentRole::Citation =>
                "You are a citation agent. Match sentences of the answer in INPUT to the sources in \
                 INPUT. Reply with JSON: {\"citations\": [{\"marker\": \"[1]\", \"sentence\": string, \
                 \"source\": string}], \"confidence\": number between 0 and 1}.",
            AgentRole::Review =>
                "You are a strict reviewer. Check the answer in INPUT against its sources. Fix errors \
                 if needed. Reply with JSON: {\"answer\": string, \"confidence\": number between 0 and 1, \
                 \"approved\": bool}.",
            _ =>
                "You are a knowledge retrieval agent. List the most relevant facts for QUERY. Reply with \
                 JSON: {\"documents\": [{\"title\": string, \"content\": string, \"score\": number}], \
                 \"confidence\": number between 0 and 1}.",
        }
    }

    fn parse_reply(&self, reply: &str) -> Value {
        if let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}')) {
            if start < end {
                if let Ok(v) = serde_json::from_str::<Value>(&reply[start..=end]) {
                    return v;
                }
            }
        }
        match self.role {
            AgentRole::Synthesis | AgentRole::Review => json!({ "answer": reply.trim() }),
            _ => json!({ "raw": reply.trim() }),
        }
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, context: &QueryContext) -> Result<AgentResult> {
        self.process_task(&json!({ "query": context.query() }), context).await
    }

    async fn process_task(&self, task: &Value, context: &QueryContext) -> Result<AgentResult> {
        let budget = if context.token_budget == 0 {
            MAX_PAYLOAD_TOKENS
        } else {
            context.token_budget.min(MAX_PAYLOAD_TOKENS)
        };
        let payload = truncate_text(
            &serde_json::to_string_pretty(task)?,
            TruncationPolicy::Tokens(budget as usize),
        );
        let prompt = format!("QUERY: {}\n\nINPUT:\n{}", context.query(), payload);

        debug!(trace_id = %context.trace_id, role = %self.role, "Prompting {}", self.model);
        let reply = self.provider
            .generate(&self.model, prompt, Some(self.instructions().to_string()))
            .await
            .map_err(|e| AgentError::Provider(e.to_string()))?;

        debug!(trace_id = %context.trace_id, role = %self.role, "Reply: {}", preview(&reply, 160));
        let data = self.parse_reply(&reply);
        if self.role == AgentRole::Synthesis
            && data["answer"].as_str().map(str::is_empty).unwrap_or(true)
        {
            return Ok(AgentResult::failure("synthesis produced no answer"));
        }

        let confidence = data["confidence"].as_f64().unwrap_or(DEFAULT_CONFIDENCE);
        Ok(AgentResult::success(data, confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ProviderDescriptor;

    struct ScriptedProvider(&'static str);

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn generate(&self, _model: &str, _prompt: String, _system: Option<String>) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor::new("scripted", "mem://", "test-model")
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl LLMProvider for FailingProvider {
        async fn generate(&self, _model: &str, _prompt: String, _system: Option<String>) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("connection refused"))
        }
        fn descriptor(&self) -> ProviderDescriptor {
            ProviderDescriptor::new("failing", "mem://", "test-model")
        }
    }

    #[tokio::test]
    async fn test_synthesis_parses_json_reply() {
        let agent = LlmAgent::new(
            AgentRole::Synthesis,
            Arc::new(ScriptedProvider("Sure! {\"answer\": \"ML is...\", \"confidence\": 0.8}")),
        );
        let ctx = QueryContext::new("What is machine learning?");
        let res = agent.process_task(&json!({"documents": []}), &ctx).await.unwrap();
        assert!(res.success);
        assert_eq!(res.data["answer"], "ML is...");
        assert_eq!(res.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_plain_text_synthesis_uses_default_confidence() {
        let agent = LlmAgent::new(AgentRole::Synthesis, Arc::new(ScriptedProvider("ML is a field of AI.")));
        let res = agent.execute(&QueryContext::new("What is ML?")).await.unwrap();
        assert_eq!(res.data["answer"], "ML is a field of AI.");
        assert_eq!(res.confidence, DEFAULT_CONFIDENCE);
    }

    #[tokio::test]
    async fn test_empty_synthesis_is_a_failure() {
        let agent = LlmAgent::new(AgentRole::Synthesis, Arc::new(ScriptedProvider("   ")));
        let res = agent.execute(&QueryContext::new("q")).await.unwrap();
        assert!(!res.success);
    }

    #[tokio::test]
    async fn test_provider_error_maps_to_agent_error() {
        let agent = LlmAgent::new(AgentRole::Review, Arc::new(FailingProvider));
        let err = agent.execute(&QueryContext::new("q")).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(_)));
    }

    #[test]
    fn test_model_defaults_to_provider_model() {
        let agent = LlmAgent::new(AgentRole::Citation, Arc::new(ScriptedProvider("{}")));
        assert_eq!(agent.model, "test-model");
        assert_eq!(agent.name(), "llm-citation");
    }
}
