//! Research Agency
//!
//! `research_agency "<query>"` answers one query and prints the JSON
//! response. `research_agency --serve [addr]` starts the HTTP surface.
//!
//! LLM backend selection (all optional):
//! - `AGENCY_LLM_BACKEND`: `ollama` (default) or `openai`
//! - `AGENCY_LLM_URL`, `AGENCY_LLM_MODEL`, `AGENCY_LLM_API_KEY`
//! - `AGENCY_CONFIG_FILE`: JSON pipeline config, created with defaults if absent

use anyhow::Result;
use ollama_rs::Ollama;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use research_agency::agent::{
    AgentRegistry, AgentRole, LLMProvider, LlmAgent, OllamaProvider, OpenAICompatibleProvider, WebSearchAgent,
};
use research_agency::orchestrator::{
    spawn_cache_pruner, ConfigManager, EventBus, PipelineConfig, SemanticCache, Supervisor,
};
use research_agency::server::{run_server, AppState};
use research_agency::utils::telemetry::init_tracing;

const DEFAULT_ADDR: &str = "0.0.0.0:8002";
const DEFAULT_OLLAMA_HOST: &str = "http://localhost";
const DEFAULT_OLLAMA_PORT: u16 = 11434;
const DEFAULT_MODEL: &str = "llama3.2:3b";

fn provider_from_env() -> Result<Arc<dyn LLMProvider>> {
    let model = std::env::var("AGENCY_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let backend = std::env::var("AGENCY_LLM_BACKEND").unwrap_or_else(|_| "ollama".to_string());

    match backend.as_str() {
        "openai" | "openai_compatible" => {
            let url = std::env::var("AGENCY_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:8000/v1".to_string());
            let api_key = std::env::var("AGENCY_LLM_API_KEY").ok();
            Ok(Arc::new(OpenAICompatibleProvider::new(url, api_key, model)))
        }
        "ollama" => {
            let host = std::env::var("AGENCY_OLLAMA_HOST").unwrap_or_else(|_| DEFAULT_OLLAMA_HOST.to_string());
            let port = match std::env::var("AGENCY_OLLAMA_PORT") {
                Ok(p) => p.parse()?,
                Err(_) => DEFAULT_OLLAMA_PORT,
            };
            let client = Ollama::new(host.clone(), port);
            Ok(Arc::new(OllamaProvider::new(client, format!("{}:{}", host, port), model)))
        }
        other => anyhow::bail!("unknown AGENCY_LLM_BACKEND '{}'", other),
    }
}

async fn load_config() -> Result<PipelineConfig> {
    let base = match std::env::var("AGENCY_CONFIG_FILE") {
        Ok(path) => ConfigManager::new(path).load().await?,
        Err(_) => PipelineConfig::default(),
    };
    Ok(base.overlay_vars(|key| std::env::var(key).ok())?)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _telemetry = init_tracing("research_agency")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("usage: research_agency \"<query>\" | --serve [addr]");
        std::process::exit(2);
    }

    let provider = provider_from_env()?;
    let mut config = load_config().await?;
    config.providers = vec![provider.descriptor()];

    let registry = Arc::new(AgentRegistry::new());
    registry.register_instance(AgentRole::Retrieval, WebSearchAgent::new()).await;
    for role in [
        AgentRole::KnowledgeGraph,
        AgentRole::FactCheck,
        AgentRole::Synthesis,
        AgentRole::Citation,
        AgentRole::Review,
    ] {
        registry.register_instance(role, LlmAgent::new(role, provider.clone())).await;
    }

    let mut builder = Supervisor::builder(registry)
        .config(config.clone())
        .events(EventBus::new());
    if config.cache_enabled {
        builder = builder.cache(Arc::new(SemanticCache::new(config.cache_namespace(), config.cache_ttl_secs)));
    }
    let supervisor = Arc::new(builder.build().await?);

    let prune_every = std::env::var("AGENCY_CACHE_PRUNE_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(300)
        .max(1);
    let _pruner = supervisor
        .cache()
        .map(|cache| spawn_cache_pruner(cache, Duration::from_secs(prune_every)));

    if args[0] == "--serve" {
        let addr = args.get(1).map(String::as_str).unwrap_or(DEFAULT_ADDR);
        info!("Starting HTTP surface");
        run_server(AppState::new(supervisor), addr).await?;
    } else {
        let query = args.join(" ");
        let response = supervisor.process_query(&query, Map::new()).await;
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    Ok(())
}
