//! Fast bounded volatile provider
//!
//! Plain `HashMap` behind a `tokio::sync::RwLock`. Capacity is enforced on
//! write: when the configured entry or byte limit would be exceeded the
//! store evicts per its [`EvictionStrategy`] before inserting. Expired
//! entries count as misses and are removed on read.

use super::{ProviderStats, SearchHit, SearchQuery, SetOptions, StorageProvider, score_value};
use crate::config::{EvictionStrategy, TierConfig};
use crate::errors::Result;
use crate::types::now_millis;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;

struct StoredEntry {
    value: Value,
    stored_at: i64,
    last_accessed: i64,
    expires_at: Option<i64>,
    size: usize,
}

impl StoredEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    total_access_ms: f64,
    accesses: u64,
}

struct MemoryState {
    entries: HashMap<String, StoredEntry>,
    total_size: usize,
    counters: Counters,
}

/// In-memory bounded volatile store.
pub struct MemoryStore {
    config: TierConfig,
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Create a store with the given tier limits.
    pub fn new(config: TierConfig) -> Self {
        Self {
            config,
            state: RwLock::new(MemoryState {
                entries: HashMap::new(),
                total_size: 0,
                counters: Counters::default(),
            }),
        }
    }

    /// Live entry count.
    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Entry-count usage as a fraction of the configured maximum.
    pub async fn usage_ratio(&self) -> f64 {
        if self.config.max_entries == 0 {
            return 1.0;
        }
        self.entry_count().await as f64 / self.config.max_entries as f64
    }

    fn serialized_size(value: &Value) -> usize {
        serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
    }

    /// Evict until one more entry of `incoming_size` bytes fits.
    fn make_room(state: &mut MemoryState, config: &TierConfig, incoming_size: usize) {
        let over_entries = |s: &MemoryState| s.entries.len() + 1 > config.max_entries;
        let over_size = |s: &MemoryState| s.total_size + incoming_size > config.max_size;
        if !over_entries(state) && !over_size(state) {
            return;
        }

        let mut candidates: Vec<(String, i64)> = state
            .entries
            .iter()
            .map(|(k, e)| {
                let rank = match config.strategy {
                    EvictionStrategy::Lru => e.last_accessed,
                    EvictionStrategy::Oldest => e.stored_at,
                };
                (k.clone(), rank)
            })
            .collect();
        candidates.sort_by_key(|(_, rank)| *rank);

        let mut evicted = 0usize;
        for (key, _) in candidates {
            if !over_entries(state) && !over_size(state) {
                break;
            }
            if let Some(entry) = state.entries.remove(&key) {
                state.total_size -= entry.size;
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "volatile store evicted entries to make room");
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryStore {
    fn name(&self) -> &'static str {
        "volatile"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.clear().await
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let started = Instant::now();
        let now = now_millis();
        let mut state = self.state.write().await;

        let expired = state
            .entries
            .get(key)
            .map(|e| e.is_expired(now))
            .unwrap_or(false);
        if expired {
            if let Some(entry) = state.entries.remove(key) {
                state.total_size -= entry.size;
            }
        }

        let value = state.entries.get_mut(key).map(|entry| {
            entry.last_accessed = now;
            entry.value.clone()
        });

        let counters = &mut state.counters;
        if value.is_some() {
            counters.hits += 1;
        } else {
            counters.misses += 1;
        }
        counters.accesses += 1;
        counters.total_access_ms += started.elapsed().as_secs_f64() * 1000.0;

        Ok(value)
    }

    async fn set(&self, key: &str, value: Value, options: Option<SetOptions>) -> Result<()> {
        let size = Self::serialized_size(&value);
        let now = now_millis();
        let options = options.unwrap_or_default();
        let expires_at = options.expires_at.or_else(|| {
            self.config
                .ttl
                .map(|ttl| now + ttl.as_millis() as i64)
        });

        let mut state = self.state.write().await;
        if let Some(old) = state.entries.remove(key) {
            state.total_size -= old.size;
        }
        Self::make_room(&mut state, &self.config, size);
        state.total_size += size;
        state.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                stored_at: now,
                last_accessed: now,
                expires_at,
                size,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.entries.remove(key) {
            Some(entry) => {
                state.total_size -= entry.size;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let now = now_millis();
        let state = self.state.read().await;
        Ok(state
            .entries
            .get(key)
            .map(|e| !e.is_expired(now))
            .unwrap_or(false))
    }

    async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.total_size = 0;
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| prefix.map(|p| k.starts_with(p)).unwrap_or(true))
            .cloned()
            .collect();
        keys.sort();
        if let Some(limit) = limit {
            keys.truncate(limit);
        }
        Ok(keys)
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let state = self.state.read().await;
        let mut hits: Vec<SearchHit> = state
            .entries
            .iter()
            .filter_map(|(key, entry)| {
                score_value(query, &entry.value).map(|score| SearchHit {
                    key: key.clone(),
                    score,
                    value: entry.value.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn stats(&self) -> Result<ProviderStats> {
        let state = self.state.read().await;
        let counters = &state.counters;
        let average_access_time_ms = if counters.accesses == 0 {
            0.0
        } else {
            counters.total_access_ms / counters.accesses as f64
        };
        Ok(ProviderStats {
            entry_count: state.entries.len(),
            total_size: state.total_size,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: 0.0,
            average_access_time_ms,
            oldest_entry: state.entries.values().map(|e| e.stored_at).min(),
            newest_entry: state.entries.values().map(|e| e.stored_at).max(),
        }
        .finalize())
    }

    fn supports_cleanup(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> Result<()> {
        let now = now_millis();
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = state.entries.remove(key) {
                state.total_size -= entry.size;
            }
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "volatile cleanup dropped expired entries");
        }
        Ok(())
    }
}
