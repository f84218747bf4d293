use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{AgentError, Result};
use crate::orchestrator::config::BudgetConfig;
use crate::utils::approx_token_count;

/// Token Budget Controller
///
/// Hands out a per-query unit-of-work budget and keeps a best-effort
/// running total of what consumers report. Nothing here enforces a
/// cutoff; agents receive the number through `QueryContext::token_budget`.
#[derive(Debug)]
pub struct TokenBudgetController {
    config: BudgetConfig,
    total_usage: AtomicU64,
    by_consumer: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageReport {
    pub total_units: u64,
    pub by_consumer: HashMap<String, u64>,
}

impl TokenBudgetController {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            total_usage: AtomicU64::new(0),
            by_consumer: Mutex::new(HashMap::new()),
        }
    }

    /// Pure function of query length and configuration
    pub fn allocate_for_query(&self, query: &str) -> u64 {
        let query_tokens = approx_token_count(query) as u64;
        self.config.base_tokens
            .saturating_add(query_tokens.saturating_mul(self.config.tokens_per_query_token))
            .min(self.config.max_tokens)
    }

    /// Record usage. Callers treat an error as "usage not recorded".
    /// The total and the per-consumer breakdown move together or not at all.
    pub fn track_usage(&self, consumer: &str, units: u64) -> Result<()> {
        let mut map = self.by_consumer
            .lock()
            .map_err(|_| AgentError::Budget("usage ledger lock poisoned".into()))?;
        *map.entry(consumer.to_string()).or_insert(0) += units;
        self.total_usage.fetch_add(units, Ordering::Relaxed);
        Ok(())
    }

    pub fn total_usage(&self) -> u64 {
        self.total_usage.load(Ordering::Relaxed)
    }

    pub fn usage_report(&self) -> UsageReport {
        let by_consumer = self.by_consumer
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        UsageReport {
            total_units: self.total_usage(),
            by_consumer,
        }
    }
}

impl Default for TokenBudgetController {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allocation_grows_with_query_and_caps() {
        let ctl = TokenBudgetController::new(BudgetConfig {
            base_tokens: 100,
            tokens_per_query_token: 10,
            max_tokens: 500,
        });
        assert_eq!(ctl.allocate_for_query(""), 100);
        // 8 bytes -> 2 approx tokens
        assert_eq!(ctl.allocate_for_query("abcdefgh"), 120);
        assert_eq!(ctl.allocate_for_query(&"x".repeat(1000)), 500);
    }

    #[test]
    fn test_allocation_is_deterministic() {
        let ctl = TokenBudgetController::default();
        let q = "What is machine learning?";
        assert_eq!(ctl.allocate_for_query(q), ctl.allocate_for_query(q));
    }

    #[test]
    fn test_track_usage_accumulates_per_consumer() {
        let ctl = TokenBudgetController::default();
        ctl.track_usage("synthesis", 300).unwrap();
        ctl.track_usage("synthesis", 200).unwrap();
        ctl.track_usage("retrieval", 50).unwrap();

        let report = ctl.usage_report();
        assert_eq!(report.total_units, 550);
        assert_eq!(report.by_consumer["synthesis"], 500);
        assert_eq!(report.by_consumer["retrieval"], 50);
    }

    #[tokio::test]
    async fn test_concurrent_tracking() {
        let ctl = Arc::new(TokenBudgetController::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ctl = ctl.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        ctl.track_usage("agent", 1).unwrap();
                    }
                })
            })
            .collect();
        futures_util::future::join_all(handles).await;
        assert_eq!(ctl.total_usage(), 1600);
    }

    #[test]
    fn test_poisoned_ledger_records_nothing() {
        let ctl = Arc::new(TokenBudgetController::default());
        ctl.track_usage("retrieval", 10).unwrap();

        let poisoner = ctl.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.by_consumer.lock().unwrap();
            panic!("poison the ledger");
        })
        .join();

        assert!(ctl.track_usage("synthesis", 500).is_err());
        assert_eq!(ctl.total_usage(), 10);
    }
}
