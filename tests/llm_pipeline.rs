use anyhow::Result;
use async_trait::async_trait;
use serde_json::Map;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use research_agency::agent::{AgentRegistry, AgentRole, LLMProvider, LlmAgent, ProviderDescriptor};
use research_agency::orchestrator::{PipelineConfig, SemanticCache, Supervisor};

/// Answers by role, recognised from the system instructions
struct RoleAwareMockProvider {
    prompts: Arc<Mutex<Vec<String>>>,
}

impl RoleAwareMockProvider {
    fn new() -> Self {
        Self { prompts: Arc::new(Mutex::new(Vec::new())) }
    }
}

#[async_trait]
impl LLMProvider for RoleAwareMockProvider {
    async fn generate(&self, _model: &str, prompt: String, system: Option<String>) -> Result<String> {
        let system = system.unwrap_or_default().to_lowercase();
        debug!("MOCK SYSTEM: {}", system);
        self.prompts.lock().await.push(prompt);

        let reply = if system.contains("knowledge retrieval") {
            r#"{"documents": [
                {"title": "Rust", "content": "Rust is a systems programming language.", "url": "https://www.rust-lang.org", "score": 0.9},
                {"title": "Ownership", "content": "Rust guarantees memory safety without GC.", "url": "https://doc.rust-lang.org/book", "score": 0.8}
            ], "confidence": 0.85}"#
        } else if system.contains("fact-checker") {
            r#"{"verified": [0, 1], "unverified": [], "confidence": 0.9}"#
        } else if system.contains("synthesis agent") {
            r#"Here you go: {"answer": "Rust is a memory-safe systems language.", "confidence": 0.82}"#
        } else if system.contains("citation agent") {
            r#"{"citations": [{"marker": "[1]", "sentence": "Rust is a memory-safe systems language.", "source": "https://www.rust-lang.org"}], "confidence": 0.9}"#
        } else if system.contains("reviewer") {
            r#"{"answer": "Rust is a memory-safe systems programming language.", "confidence": 0.88, "approved": true}"#
        } else {
            "I don't know."
        };
        Ok(reply.to_string())
    }

    fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor::new("mock", "mem://mock", "mock-model")
    }
}

async fn llm_supervisor(provider: Arc<RoleAwareMockProvider>) -> Supervisor {
    let registry = Arc::new(AgentRegistry::new());
    for role in [
        AgentRole::Retrieval,
        AgentRole::FactCheck,
        AgentRole::Synthesis,
        AgentRole::Citation,
        AgentRole::Review,
    ] {
        registry.register_instance(role, LlmAgent::new(role, provider.clone())).await;
    }

    let mut config = PipelineConfig::default();
    config.providers = vec![provider.descriptor()];
    let cache = Arc::new(SemanticCache::new(config.cache_namespace(), config.cache_ttl_secs));

    Supervisor::builder(registry)
        .config(config)
        .cache(cache)
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_llm_agents_drive_full_pipeline() {
    let provider = Arc::new(RoleAwareMockProvider::new());
    let supervisor = llm_supervisor(provider.clone()).await;

    let response = supervisor.process_query("Explain Rust's memory model", Map::new()).await;

    assert!(response.success, "errors: {:?}", response.metadata.errors);
    assert_eq!(response.answer, "Rust is a memory-safe systems programming language.");
    assert_eq!(response.confidence, 0.88);
    assert_eq!(response.sources.len(), 2);
    assert_eq!(response.citations.len(), 1);
    assert_eq!(
        response.metadata.pipeline_stages,
        vec!["retrieval", "fact_check", "synthesis", "citation", "review"]
    );

    // Synthesis saw the retrieved documents
    let prompts = provider.prompts.lock().await;
    assert_eq!(prompts.len(), 5);
    assert!(prompts.iter().any(|p| p.contains("memory safety without GC") && p.contains("verification")));
}

#[tokio::test]
async fn test_cache_namespace_follows_provider() {
    let provider = Arc::new(RoleAwareMockProvider::new());
    let supervisor = llm_supervisor(provider).await;
    let cache = supervisor.cache().unwrap();

    assert!(cache.namespace().starts_with("ns-"));
    supervisor.process_query("Explain Rust's memory model", Map::new()).await;
    assert_eq!(cache.stats().await.unwrap().entries, 1);
}
