//! Web Search Retrieval Agent
//!
//! Retrieves documents from the DuckDuckGo HTML endpoint (no API key
//! required). Scores decay with rank so downstream stages can weight them.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{Agent, AgentResult};
use crate::error::{AgentError, Result};
use crate::orchestrator::QueryContext;

const DEFAULT_RESULTS: usize = 5;

/// Retrieval agent backed by DuckDuckGo
pub struct WebSearchAgent {
    client: Client,
    base_url: String,
    num_results: usize,
}

impl WebSearchAgent {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .user_agent("Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36")
                .build()
                .unwrap_or_default(),
            base_url: "https://html.duckduckgo.com/html/".to_string(),
            num_results: DEFAULT_RESULTS,
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_num_results(mut self, n: usize) -> Self {
        self.num_results = n.clamp(1, 10);
        self
    }

    async fn search(&self, query: &str) -> Result<String> {
        let url = format!("{}?q={}", self.base_url, urlencoding::encode(query));
        debug!("Searching DuckDuckGo: {}", query);

        let response = self.client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| AgentError::Execution(format!("search request failed: {}", e)))?;

        response.text()
            .await
            .map_err(|e| AgentError::Execution(format!("failed to read search response: {}", e)))
    }
}

impl Default for WebSearchAgent {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract up to `max_results` documents from a DuckDuckGo HTML page
pub(crate) fn parse_results(html: &str, max_results: usize) -> Vec<Value> {
    let snippet_re = Regex::new(r#"class="result__snippet"[^>]*>([^<]+)"#);
    let title_re = Regex::new(r#"class="result__a"[^>]*>([^<]+)"#);
    let url_re = Regex::new(r#"class="result__url"[^>]*>([^<]+)"#);

    let (Ok(snippet_re), Ok(title_re), Ok(url_re)) = (snippet_re, title_re, url_re) else {
        return Vec::new();
    };

    let capture = |re: &Regex| -> Vec<String> {
        re.captures_iter(html)
            .filter_map(|c| c.get(1))
            .map(|m| html_escape::decode_html_entities(m.as_str().trim()).to_string())
            .collect()
    };
    let snippets = capture(&snippet_re);
    let titles = capture(&title_re);
    let urls = capture(&url_re);

    let count = snippets.len().min(titles.len()).min(max_results);
    (0..count)
        .filter(|&i| !titles[i].is_empty() && !snippets[i].is_empty())
        .map(|i| {
            json!({
                "title": titles[i],
                "content": snippets[i],
                "url": urls.get(i).cloned().unwrap_or_default(),
                "score": 1.0 / (1.0 + i as f64 * 0.25),
            })
        })
        .collect()
}

#[async_trait]
impl Agent for WebSearchAgent {
    fn name(&self) -> &str {
        "web_search"
    }

    async fn execute(&self, context: &QueryContext) -> Result<AgentResult> {
        let html = self.search(context.query()).await?;
        let documents = parse_results(&html, self.num_results);

        if documents.is_empty() {
            warn!(trace_id = %context.trace_id, "Could not parse any search results");
            return Ok(AgentResult::failure("no documents retrieved"));
        }

        let confidence = documents
            .iter()
            .filter_map(|d| d["score"].as_f64())
            .fold(0.0_f64, f64::max);

        Ok(AgentResult::success(
            json!({ "query": context.query(), "documents": documents }),
            confidence,
        ))
    }
}
