//! Storage Provider contract and its implementations
//!
//! Every tier speaks the same uniform async key/value contract:
//! [`StorageProvider`]. Three conforming implementations live here:
//!
//! - [`MemoryStore`](memory::MemoryStore) — fast, bounded, volatile
//! - [`FileStore`](file::FileStore) — durable local store with its own
//!   capacity and eviction
//! - [`HttpRemote`](remote::HttpRemote) — the remote system of record,
//!   which may be unavailable and then degrades gracefully
//!
//! [`MockRemote`](mock::MockRemote) is an in-memory provider with call
//! counters and scripted behavior for tests.

use crate::errors::Result;
use crate::types::IncrementalUpdate;
use async_trait::async_trait;
use serde_json::Value;

pub mod file;
pub mod memory;
pub mod mock;
pub mod remote;

/// Hints attached to a write. Providers may ignore hints they cannot honor
/// but must never corrupt the stored value.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Expiry as epoch milliseconds
    pub expires_at: Option<i64>,
    /// Higher-priority entries should be evicted last
    pub priority: Option<i64>,
    /// Compress the value at rest
    pub compress: bool,
    /// Encrypt the value at rest
    pub encrypt: bool,
}

impl SetOptions {
    /// Options with only an expiry set.
    pub fn expiring_at(expires_at: i64) -> Self {
        Self {
            expires_at: Some(expires_at),
            ..Default::default()
        }
    }
}

/// Point-in-time statistics for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderStats {
    /// Live entries
    pub entry_count: usize,
    /// Total serialized size in bytes
    pub total_size: usize,
    /// Reads that found a value
    pub hits: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// `hits / (hits + misses)`, 0 when no reads yet
    pub hit_rate: f64,
    /// Mean access latency in milliseconds
    pub average_access_time_ms: f64,
    /// Write timestamp of the oldest live entry
    pub oldest_entry: Option<i64>,
    /// Write timestamp of the newest live entry
    pub newest_entry: Option<i64>,
}

impl ProviderStats {
    /// Recompute the hit rate from the counters.
    pub fn finalize(mut self) -> Self {
        let total = self.hits + self.misses;
        self.hit_rate = if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        };
        self
    }
}

/// A search request against a provider.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Free-text query matched against titles and message bodies
    pub text: String,
    /// Restrict results to one agent's sessions
    pub agent_id: Option<String>,
    /// Maximum hits to return
    pub limit: usize,
}

impl SearchQuery {
    /// Free-text query with a limit.
    pub fn text(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            agent_id: None,
            limit,
        }
    }

    /// All sessions of one agent (no text filter).
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            agent_id: Some(agent_id.into()),
            limit: usize::MAX,
        }
    }
}

/// A single search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    /// Provider-level key of the matching record
    pub key: String,
    /// Relevance score, higher is better
    pub score: f64,
    /// The matching value
    pub value: Value,
}

/// Uniform async contract implemented by all three tiers.
///
/// Optional capabilities are explicit default methods rather than duck-typed
/// runtime probes: a provider that supports richer cleanup overrides
/// [`supports_cleanup`](Self::supports_cleanup) and
/// [`cleanup`](Self::cleanup); a provider that can feed incremental updates
/// overrides [`changes_since`](Self::changes_since).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short provider name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// One-time initialization (open files, verify connectivity).
    async fn init(&self) -> Result<()>;

    /// Release resources. The provider must not be used afterwards.
    async fn destroy(&self) -> Result<()>;

    /// Fetch a value.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Store a value.
    async fn set(&self, key: &str, value: Value, options: Option<SetOptions>) -> Result<()>;

    /// Delete a value. Returns whether a value was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a value exists without touching access statistics.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remove all values.
    async fn clear(&self) -> Result<()>;

    /// Batched get; result order matches `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Value>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Batched set.
    async fn mset(&self, entries: Vec<(String, Value)>, options: Option<SetOptions>) -> Result<()> {
        for (key, value) in entries {
            self.set(&key, value, options.clone()).await?;
        }
        Ok(())
    }

    /// Batched delete. Returns how many keys were removed.
    async fn mdelete(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// List keys, optionally filtered by prefix and capped.
    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<String>>;

    /// Search stored values.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>>;

    /// Point-in-time statistics.
    async fn stats(&self) -> Result<ProviderStats>;

    /// Whether the provider can currently serve requests. Always true for
    /// local tiers; the remote tier flips this on connectivity loss.
    fn is_available(&self) -> bool {
        true
    }

    /// Whether [`cleanup`](Self::cleanup) does real work for this provider.
    fn supports_cleanup(&self) -> bool {
        false
    }

    /// Drop expired or excess entries. No-op unless
    /// [`supports_cleanup`](Self::supports_cleanup) returns true.
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Changes for one agent newer than the watermark. `Ok(None)` when the
    /// provider does not support incremental feeds.
    async fn changes_since(
        &self,
        _agent_id: &str,
        _since: Option<i64>,
    ) -> Result<Option<Vec<IncrementalUpdate>>> {
        Ok(None)
    }
}

/// Crude relevance score for local scans: title matches outrank body
/// matches, and an empty query matches everything at a floor score.
pub(crate) fn score_value(query: &SearchQuery, value: &Value) -> Option<f64> {
    if let Some(agent_id) = &query.agent_id {
        if value.get("agentId").and_then(Value::as_str) != Some(agent_id.as_str()) {
            return None;
        }
    }
    if query.text.is_empty() {
        return Some(0.1);
    }
    let needle = query.text.to_lowercase();
    let title_hit = value
        .get("title")
        .and_then(Value::as_str)
        .map(|t| t.to_lowercase().contains(&needle))
        .unwrap_or(false);
    if title_hit {
        return Some(1.0);
    }
    let body_hit = value
        .get("messages")
        .and_then(Value::as_array)
        .map(|msgs| {
            msgs.iter().any(|m| {
                m.get("content")
                    .and_then(Value::as_str)
                    .map(|c| c.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);
    body_hit.then_some(0.5)
}
