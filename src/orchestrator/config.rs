//! Pipeline Configuration
//!
//! Resolved once per supervisor and shared read-only by every query.
//! Sources, lowest precedence first: built-in defaults, a JSON file
//! (`ConfigManager`), `AGENCY_*` environment variables.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::agent::{AgentRole, ProviderDescriptor};
use crate::error::{AgentError, Result};

/// Per-stage timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StageTimeouts {
    pub retrieval_ms: u64,
    pub enrichment_ms: u64,
    pub fact_check_ms: u64,
    pub synthesis_ms: u64,
    pub citation_ms: u64,
    pub review_ms: u64,
    /// Whole sub-pipeline budget for one scatter-gather domain
    pub domain_ms: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            retrieval_ms: 15_000,
            enrichment_ms: 15_000,
            fact_check_ms: 20_000,
            synthesis_ms: 30_000,
            citation_ms: 15_000,
            review_ms: 20_000,
            domain_ms: 30_000,
        }
    }
}

impl StageTimeouts {
    pub fn uniform(ms: u64) -> Self {
        Self {
            retrieval_ms: ms,
            enrichment_ms: ms,
            fact_check_ms: ms,
            synthesis_ms: ms,
            citation_ms: ms,
            review_ms: ms,
            domain_ms: ms.saturating_mul(2),
        }
    }

    pub fn for_role(&self, role: AgentRole) -> Duration {
        let ms = match role {
            AgentRole::Retrieval | AgentRole::KnowledgeGraph => self.retrieval_ms,
            AgentRole::Browser | AgentRole::Database | AgentRole::Pdf => self.enrichment_ms,
            AgentRole::FactCheck => self.fact_check_ms,
            AgentRole::Synthesis => self.synthesis_ms,
            AgentRole::Citation => self.citation_ms,
            AgentRole::Review => self.review_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn domain(&self) -> Duration {
        Duration::from_millis(self.domain_ms)
    }

    fn all(&self) -> [u64; 7] {
        [
            self.retrieval_ms,
            self.enrichment_ms,
            self.fact_check_ms,
            self.synthesis_ms,
            self.citation_ms,
            self.review_ms,
            self.domain_ms,
        ]
    }
}

/// Parameters of `TokenBudgetController::allocate_for_query`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub base_tokens: u64,
    pub tokens_per_query_token: u64,
    pub max_tokens: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            base_tokens: 2_000,
            tokens_per_query_token: 20,
            max_tokens: 16_000,
        }
    }
}

/// Upper bound for `cache_ttl_secs`
pub const MAX_CACHE_TTL_SECS: u64 = 365 * 24 * 3600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub timeouts: StageTimeouts,
    pub max_concurrent_agents: usize,
    pub enabled_agents: BTreeSet<AgentRole>,
    pub min_confidence: f64,
    pub fail_fast: bool,
    pub enable_review: bool,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub max_scatter_domains: usize,
    /// Multiplier applied to synthesis confidence when fact-checking did not succeed
    pub fact_check_penalty: f64,
    pub budget: BudgetConfig,
    /// Active LLM backends; they determine the cache namespace
    pub providers: Vec<ProviderDescriptor>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            timeouts: StageTimeouts::default(),
            max_concurrent_agents: 4,
            enabled_agents: AgentRole::ALL.into_iter().collect(),
            min_confidence: 0.5,
            fail_fast: false,
            enable_review: true,
            cache_enabled: true,
            cache_ttl_secs: 3600,
            max_scatter_domains: 3,
            fact_check_penalty: 0.85,
            budget: BudgetConfig::default(),
            providers: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with `AGENCY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().overlay_vars(|key| std::env::var(key).ok())
    }

    /// Overlay variables resolved through `lookup` onto this config
    pub fn overlay_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup("AGENCY_AGENT_TIMEOUT_SECS") {
            self.timeouts = StageTimeouts::uniform(parse_var::<u64>("AGENCY_AGENT_TIMEOUT_SECS", &v)? * 1000);
        }
        if let Some(v) = lookup("AGENCY_MAX_PARALLEL_AGENTS") {
            self.max_concurrent_agents = parse_var("AGENCY_MAX_PARALLEL_AGENTS", &v)?;
        }
        if let Some(v) = lookup("AGENCY_MIN_CONFIDENCE") {
            self.min_confidence = parse_var("AGENCY_MIN_CONFIDENCE", &v)?;
        }
        if let Some(v) = lookup("AGENCY_FAIL_FAST") {
            self.fail_fast = parse_bool("AGENCY_FAIL_FAST", &v)?;
        }
        if let Some(v) = lookup("AGENCY_ENABLE_REVIEW") {
            self.enable_review = parse_bool("AGENCY_ENABLE_REVIEW", &v)?;
        }
        if let Some(v) = lookup("AGENCY_CACHE_ENABLED") {
            self.cache_enabled = parse_bool("AGENCY_CACHE_ENABLED", &v)?;
        }
        if let Some(v) = lookup("AGENCY_CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_var("AGENCY_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("AGENCY_ENABLED_AGENTS") {
            let mut roles = BTreeSet::new();
            for name in v.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let role = AgentRole::parse(name)
                    .ok_or_else(|| AgentError::Config(format!("unknown agent role '{}'", name)))?;
                roles.insert(role);
            }
            self.enabled_agents = roles;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(AgentError::Config(format!(
                "min_confidence must be within [0, 1], got {}",
                self.min_confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.fact_check_penalty) {
            return Err(AgentError::Config(format!(
                "fact_check_penalty must be within [0, 1], got {}",
                self.fact_check_penalty
            )));
        }
        if self.max_concurrent_agents == 0 {
            return Err(AgentError::Config("max_concurrent_agents must be at least 1".into()));
        }
        if self.timeouts.all().iter().any(|&t| t == 0) {
            return Err(AgentError::Config("stage timeouts must be non-zero".into()));
        }
        if self.cache_enabled && self.cache_ttl_secs == 0 {
            return Err(AgentError::Config("cache_ttl_secs must be non-zero when caching is enabled".into()));
        }
        if self.cache_ttl_secs > MAX_CACHE_TTL_SECS {
            return Err(AgentError::Config(format!(
                "cache_ttl_secs must be at most {} (one year), got {}",
                MAX_CACHE_TTL_SECS, self.cache_ttl_secs
            )));
        }
        Ok(())
    }

    pub fn is_enabled(&self, role: AgentRole) -> bool {
        self.enabled_agents.contains(&role)
    }

    pub fn timeout_for(&self, role: AgentRole) -> Duration {
        self.timeouts.for_role(role)
    }

    /// Namespace isolating cache entries of differently configured deployments.
    ///
    /// Order of providers does not matter; any change to a backend name,
    /// endpoint or model yields a different namespace.
    pub fn cache_namespace(&self) -> String {
        if self.providers.is_empty() {
            return "default".to_string();
        }
        let mut prints: Vec<String> = self.providers.iter().map(ProviderDescriptor::fingerprint).collect();
        prints.sort();
        let mut hasher = Sha256::new();
        for p in &prints {
            hasher.update(p.as_bytes());
            hasher.update(b"\n");
        }
        format!("ns-{}", &hex::encode(hasher.finalize())[..16])
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>()
        .map_err(|_| AgentError::Config(format!("invalid value for {}: '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AgentError::Config(format!("invalid boolean for {}: '{}'", key, value))),
    }
}

/// Loads and saves the JSON form of `PipelineConfig`
pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the file, writing the defaults first if it does not exist
    pub async fn load(&self) -> Result<PipelineConfig> {
        if !self.path.exists() {
            let default = PipelineConfig::default();
            self.save(&default).await?;
            return Ok(default);
        }
        let content = fs::read_to_string(&self.path).await?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config: &PipelineConfig) -> Result<()> {
        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let c = PipelineConfig::default();
        assert_eq!(c.timeout_for(AgentRole::Retrieval), Duration::from_secs(15));
        assert_eq!(c.timeout_for(AgentRole::FactCheck), Duration::from_secs(20));
        assert_eq!(c.timeout_for(AgentRole::Synthesis), Duration::from_secs(30));
        assert_eq!(c.timeout_for(AgentRole::Citation), Duration::from_secs(15));
        assert_eq!(c.timeout_for(AgentRole::Review), Duration::from_secs(20));
        assert_eq!(c.min_confidence, 0.5);
        assert!(!c.fail_fast);
        assert_eq!(c.enabled_agents.len(), AgentRole::ALL.len());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_overlay_vars() {
        let c = PipelineConfig::default()
            .overlay_vars(vars(&[
                ("AGENCY_FAIL_FAST", "true"),
                ("AGENCY_MIN_CONFIDENCE", "0.7"),
                ("AGENCY_ENABLED_AGENTS", "retrieval, synthesis,fact-check"),
                ("AGENCY_AGENT_TIMEOUT_SECS", "5"),
            ]))
            .unwrap();
        assert!(c.fail_fast);
        assert_eq!(c.min_confidence, 0.7);
        assert_eq!(c.enabled_agents.len(), 3);
        assert!(c.is_enabled(AgentRole::FactCheck));
        assert_eq!(c.timeout_for(AgentRole::Synthesis), Duration::from_secs(5));
    }

    #[test]
    fn test_overlay_rejects_bad_values() {
        assert!(PipelineConfig::default().overlay_vars(vars(&[("AGENCY_FAIL_FAST", "maybe")])).is_err());
        assert!(PipelineConfig::default().overlay_vars(vars(&[("AGENCY_MIN_CONFIDENCE", "1.5")])).is_err());
        assert!(PipelineConfig::default().overlay_vars(vars(&[("AGENCY_ENABLED_AGENTS", "oracle")])).is_err());
        assert!(PipelineConfig::default().overlay_vars(vars(&[("AGENCY_MAX_PARALLEL_AGENTS", "0")])).is_err());
        assert!(PipelineConfig::default()
            .overlay_vars(vars(&[("AGENCY_CACHE_TTL_SECS", "18446744073709551615")]))
            .is_err());
    }

    #[test]
    fn test_cache_ttl_upper_bound() {
        let mut config = PipelineConfig::default();
        config.cache_ttl_secs = MAX_CACHE_TTL_SECS;
        assert!(config.validate().is_ok());
        config.cache_ttl_secs = MAX_CACHE_TTL_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_namespace_depends_on_providers_not_order() {
        let a = ProviderDescriptor::new("ollama", "http://localhost:11434", "llama3.2:3b");
        let b = ProviderDescriptor::new("openai_compatible", "http://localhost:8000/v1", "qwen3:8b");

        let mut c1 = PipelineConfig::default();
        c1.providers = vec![a.clone(), b.clone()];
        let mut c2 = PipelineConfig::default();
        c2.providers = vec![b.clone(), a.clone()];
        assert_eq!(c1.cache_namespace(), c2.cache_namespace());

        let mut c3 = PipelineConfig::default();
        c3.providers = vec![a, ProviderDescriptor::new("openai_compatible", "http://localhost:8000/v1", "qwen3:14b")];
        assert_ne!(c1.cache_namespace(), c3.cache_namespace());
        assert_eq!(PipelineConfig::default().cache_namespace(), "default");
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ConfigManager::new(dir.path().join("pipeline.json"));

        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded, PipelineConfig::default());

        let mut custom = PipelineConfig::default();
        custom.fail_fast = true;
        custom.cache_ttl_secs = 60;
        manager.save(&custom).await.unwrap();
        assert_eq!(manager.load().await.unwrap(), custom);
    }
}
