//! Durable local provider backed by one JSON file per key
//!
//! Values are persisted under a root directory, one file per key, with an
//! in-memory index for listing and stats. The index is rebuilt from disk on
//! [`init`](StorageProvider::init), so the store survives restarts. The
//! store enforces its own entry cap with oldest-first eviction and drops
//! expired records on [`cleanup`](StorageProvider::cleanup).

use super::{ProviderStats, SearchHit, SearchQuery, SetOptions, StorageProvider, score_value};
use crate::config::TierConfig;
use crate::errors::Result;
use crate::types::now_millis;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Serialize, Deserialize)]
struct FileRecord {
    key: String,
    value: Value,
    stored_at: i64,
    expires_at: Option<i64>,
}

#[derive(Clone)]
struct IndexEntry {
    path: PathBuf,
    stored_at: i64,
    expires_at: Option<i64>,
    size: usize,
}

#[derive(Default)]
struct Counters {
    hits: u64,
    misses: u64,
    total_access_ms: f64,
    accesses: u64,
}

struct FileState {
    index: HashMap<String, IndexEntry>,
    total_size: usize,
    counters: Counters,
}

/// Durable file-per-key JSON store.
pub struct FileStore {
    root: PathBuf,
    config: TierConfig,
    state: RwLock<FileState>,
}

impl FileStore {
    /// Create a store rooted at `root` with the given tier limits. Call
    /// [`init`](StorageProvider::init) before use.
    pub fn new(root: impl Into<PathBuf>, config: TierConfig) -> Self {
        Self {
            root: root.into(),
            config,
            state: RwLock::new(FileState {
                index: HashMap::new(),
                total_size: 0,
                counters: Counters::default(),
            }),
        }
    }

    /// Filesystem path for a key. Keys are percent-free but may contain
    /// `:`; every non-alphanumeric byte maps to `_` plus a short hash of
    /// the full key to keep distinct keys distinct.
    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in key.as_bytes() {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(0x1000_0000_01b3);
        }
        self.root.join(format!("{safe}-{hash:016x}.json"))
    }

    async fn read_record(path: &Path) -> Result<FileRecord> {
        let bytes = fs::read(path).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn load_value(&self, key: &str) -> Result<Option<Value>> {
        let entry = {
            let state = self.state.read().await;
            state.index.get(key).cloned()
        };
        let Some(entry) = entry else {
            return Ok(None);
        };
        if entry.expires_at.is_some_and(|at| at <= now_millis()) {
            self.delete(key).await?;
            return Ok(None);
        }
        match Self::read_record(&entry.path).await {
            Ok(record) => Ok(Some(record.value)),
            Err(e) => {
                warn!(key, error = %e, "durable record unreadable, dropping from index");
                self.state.write().await.index.remove(key);
                Ok(None)
            }
        }
    }

    /// Evict oldest entries until the cap is respected. Returns evicted keys.
    async fn enforce_cap(&self) -> Result<Vec<String>> {
        let victims: Vec<(String, IndexEntry)> = {
            let state = self.state.read().await;
            if state.index.len() <= self.config.max_entries {
                return Ok(Vec::new());
            }
            let excess = state.index.len() - self.config.max_entries;
            let mut by_age: Vec<(String, IndexEntry)> = state
                .index
                .iter()
                .map(|(k, e)| (k.clone(), e.clone()))
                .collect();
            by_age.sort_by_key(|(_, e)| e.stored_at);
            by_age.truncate(excess);
            by_age
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for (key, entry) in victims {
            let _ = fs::remove_file(&entry.path).await;
            let mut state = self.state.write().await;
            if state.index.remove(&key).is_some() {
                state.total_size -= entry.size;
                evicted.push(key);
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "durable store evicted oldest entries");
        }
        Ok(evicted)
    }
}

#[async_trait]
impl StorageProvider for FileStore {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let mut dir = fs::read_dir(&self.root).await?;
        let mut state = self.state.write().await;
        state.index.clear();
        state.total_size = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(record) => {
                    let size = serde_json::to_string(&record.value)
                        .map(|s| s.len())
                        .unwrap_or(0);
                    state.total_size += size;
                    state.index.insert(
                        record.key.clone(),
                        IndexEntry {
                            path,
                            stored_at: record.stored_at,
                            expires_at: record.expires_at,
                            size,
                        },
                    );
                }
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable durable file"),
            }
        }
        debug!(entries = state.index.len(), root = %self.root.display(), "durable store initialized");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.index.clear();
        state.total_size = 0;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let started = Instant::now();
        let value = self.load_value(key).await?;
        let mut state = self.state.write().await;
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
        let options = options.unwrap_or_default();
        let now = now_millis();
        let expires_at = options.expires_at.or_else(|| {
            self.config.ttl.map(|ttl| now + ttl.as_millis() as i64)
        });
        let record = FileRecord {
            key: key.to_string(),
            value,
            stored_at: now,
            expires_at,
        };
        let bytes = serde_json::to_vec_pretty(&record)?;
        let size = serde_json::to_string(&record.value).map(|s| s.len()).unwrap_or(0);
        let path = self.path_for(key);
        fs::write(&path, &bytes).await?;

        {
            let mut state = self.state.write().await;
            if let Some(old) = state.index.remove(key) {
                state.total_size -= old.size;
            }
            state.total_size += size;
            state.index.insert(
                key.to_string(),
                IndexEntry {
                    path,
                    stored_at: now,
                    expires_at,
                    size,
                },
            );
        }
        self.enforce_cap().await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let entry = {
            let mut state = self.state.write().await;
            let entry = state.index.remove(key);
            if let Some(e) = &entry {
                state.total_size -= e.size;
            }
            entry
        };
        match entry {
            Some(e) => {
                let _ = fs::remove_file(&e.path).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .index
            .get(key)
            .map(|e| !e.expires_at.is_some_and(|at| at <= now_millis()))
            .unwrap_or(false))
    }

    async fn clear(&self) -> Result<()> {
        let paths: Vec<PathBuf> = {
            let mut state = self.state.write().await;
            state.total_size = 0;
            state.index.drain().map(|(_, e)| e.path).collect()
        };
        for path in paths {
            let _ = fs::remove_file(&path).await;
        }
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut keys: Vec<String> = state
            .index
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
        let keys = self.list(None, None).await?;
        let mut hits = Vec::new();
        for key in keys {
            if let Some(value) = self.load_value(&key).await? {
                if let Some(score) = score_value(query, &value) {
                    hits.push(SearchHit { key, score, value });
                }
            }
        }
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
            entry_count: state.index.len(),
            total_size: state.total_size,
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: 0.0,
            average_access_time_ms,
            oldest_entry: state.index.values().map(|e| e.stored_at).min(),
            newest_entry: state.index.values().map(|e| e.stored_at).max(),
        }
        .finalize())
    }

    fn supports_cleanup(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> Result<()> {
        let now = now_millis();
        let expired: Vec<String> = {
            let state = self.state.read().await;
            state
                .index
                .iter()
                .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in &expired {
            self.delete(key).await?;
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "durable cleanup dropped expired entries");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionStrategy;
    use serde_json::json;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir, max_entries: usize) -> FileStore {
        FileStore::new(
            dir.path(),
            TierConfig {
                max_size: 1024 * 1024,
                max_entries,
                strategy: EvictionStrategy::Oldest,
                ttl: None,
            },
        )
    }

    #[tokio::test]
    async fn test_round_trip_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = store_in(&dir, 10);
            store.init().await.unwrap();
            store.set("session:s1", json!({"id": "s1"}), None).await.unwrap();
        }
        let reopened = store_in(&dir, 10);
        reopened.init().await.unwrap();
        assert_eq!(
            reopened.get("session:s1").await.unwrap(),
            Some(json!({"id": "s1"}))
        );
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 10);
        store.init().await.unwrap();
        store.set("k", json!(1), None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cap_evicts_oldest_first() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 2);
        store.init().await.unwrap();
        store.set("a", json!(1), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.set("b", json!(2), None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.set("c", json!(3), None).await.unwrap();

        let keys = store.list(None, None).await.unwrap();
        assert_eq!(keys.len(), 2);
        assert!(!keys.contains(&"a".to_string()));
    }

    #[tokio::test]
    async fn test_distinct_keys_never_collide() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 10);
        store.init().await.unwrap();
        // Same sanitized form, different raw keys.
        store.set("session:a", json!("one"), None).await.unwrap();
        store.set("session_a", json!("two"), None).await.unwrap();
        assert_eq!(store.get("session:a").await.unwrap(), Some(json!("one")));
        assert_eq!(store.get("session_a").await.unwrap(), Some(json!("two")));
    }

    #[tokio::test]
    async fn test_search_matches_title() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir, 10);
        store.init().await.unwrap();
        store
            .set(
                "session:s1",
                json!({"agentId": "a1", "title": "Rust questions", "messages": []}),
                None,
            )
            .await
            .unwrap();
        store
            .set(
                "session:s2",
                json!({"agentId": "a1", "title": "Groceries", "messages": []}),
                None,
            )
            .await
            .unwrap();

        let hits = store.search(&SearchQuery::text("rust", 10)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "session:s1");
    }
}
