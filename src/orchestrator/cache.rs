//! Semantic Response Cache
//!
//! Maps a normalized query to a previously computed full response.
//! "Semantic" refers to what is cached (the final answer), not to how
//! keys match: lookups are exact after normalization.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Key-value store with TTL holding full responses.
///
/// Implementations may fail; callers degrade a failed `get` to a miss and
/// a failed `put` to "not cached".
#[async_trait]
pub trait ResponseCache: Send + Sync {
    fn namespace(&self) -> &str;
    async fn get(&self, query: &str) -> Result<Option<Value>>;
    async fn put(&self, query: &str, value: Value) -> Result<()>;
    /// Remove expired entries, returning how many were removed
    async fn prune(&self) -> Result<usize>;
    async fn stats(&self) -> Result<CacheStats>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// A TTL too large to represent as a deadline never expires
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let deadline = i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(ChronoDuration::try_seconds)
            .and_then(|ttl| self.created_at.checked_add_signed(ttl));
        match deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub namespace: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub ttl_seconds: u64,
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Trim, case-fold and collapse inner whitespace
pub fn normalize_query(query: &str) -> String {
    query.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// In-memory `ResponseCache`; last writer wins on concurrent `put`
pub struct SemanticCache {
    namespace: String,
    ttl_seconds: u64,
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Clock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl SemanticCache {
    pub fn new(namespace: impl Into<String>, ttl_seconds: u64) -> Self {
        Self {
            namespace: namespace.into(),
            ttl_seconds,
            entries: RwLock::new(HashMap::new()),
            clock: Arc::new(Utc::now),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn key_for(&self, query: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_query(query).as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn invalidate(&self, query: &str) -> bool {
        let key = self.key_for(query);
        self.entries.write().await.remove(&key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ResponseCache for SemanticCache {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, query: &str) -> Result<Option<Value>> {
        let key = self.key_for(query);
        let now = (self.clock)();

        let expired = {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    debug!("Cache hit in namespace {}", self.namespace);
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut entries = self.entries.write().await;
            // Re-check: a concurrent put may have refreshed the entry
            if entries.get(&key).map(|e| e.is_expired(now)).unwrap_or(false) {
                entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(&self, query: &str, value: Value) -> Result<()> {
        let key = self.key_for(query);
        let entry = CacheEntry {
            key: key.clone(),
            value,
            created_at: (self.clock)(),
            ttl_seconds: self.ttl_seconds,
        };
        self.entries.write().await.insert(key, entry);
        Ok(())
    }

    async fn prune(&self) -> Result<usize> {
        let now = (self.clock)();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats> {
        Ok(CacheStats {
            namespace: self.namespace.clone(),
            entries: self.entries.read().await.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ttl_seconds: self.ttl_seconds,
        })
    }
}

/// Periodically prune expired entries until the handle is aborted
pub fn spawn_cache_pruner(cache: Arc<dyn ResponseCache>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match cache.prune().await {
                Ok(0) => {}
                Ok(n) => info!("Pruned {} expired cache entries", n),
                Err(e) => warn!("Cache prune failed: {}", e),
            }
        }
    })
}
