//! In-memory mock provider for tests and simulations
//!
//! Stands in for the remote tier: counts every call, can be toggled
//! unavailable, can be scripted to fail, and serves a scripted incremental
//! update feed. Behaves like [`HttpRemote`](super::remote::HttpRemote) while
//! unavailable (graceful degradation, no errors).

use super::{ProviderStats, SearchHit, SearchQuery, SetOptions, StorageProvider, score_value};
use crate::errors::{Result, StorageError};
use crate::types::{IncrementalUpdate, Session, now_millis};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Per-operation call counters observed by tests.
#[derive(Debug, Default)]
pub struct CallCounts {
    /// `get` calls
    pub gets: AtomicUsize,
    /// `set` calls
    pub sets: AtomicUsize,
    /// `delete` calls
    pub deletes: AtomicUsize,
    /// `list` calls
    pub lists: AtomicUsize,
    /// `search` calls
    pub searches: AtomicUsize,
    /// `changes_since` calls
    pub changes: AtomicUsize,
}

/// Scripted in-memory provider with call counters.
pub struct MockRemote {
    records: Mutex<HashMap<String, Value>>,
    changes_feed: Mutex<Vec<IncrementalUpdate>>,
    available: AtomicBool,
    fail_all: AtomicBool,
    fail_critical: AtomicBool,
    /// Call counters, public so tests can assert on them directly.
    pub calls: CallCounts,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemote {
    /// Empty, available remote.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            changes_feed: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            fail_all: AtomicBool::new(false),
            fail_critical: AtomicBool::new(false),
            calls: CallCounts::default(),
        }
    }

    /// Toggle availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// When set, every operation returns a provider error.
    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// When set, every operation returns a critical error.
    pub fn fail_critical(&self, fail: bool) {
        self.fail_critical.store(fail, Ordering::SeqCst);
    }

    /// Seed a raw record without counting a call.
    pub async fn seed(&self, key: impl Into<String>, value: Value) {
        self.records.lock().await.insert(key.into(), value);
    }

    /// Seed a session record under its typed key.
    pub async fn seed_session(&self, session: &Session) {
        let key = crate::keys::StoreKey::session(&session.id).encode();
        let value = serde_json::to_value(session).expect("session serializes");
        self.seed(key, value).await;
    }

    /// Push a scripted incremental update onto the feed.
    pub async fn push_change(&self, update: IncrementalUpdate) {
        self.changes_feed.lock().await.push(update);
    }

    /// Raw record count.
    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }

    fn check_failure(&self, operation: &str) -> Result<()> {
        if self.fail_critical.load(Ordering::SeqCst) {
            return Err(StorageError::Critical(format!(
                "scripted critical failure in {operation}"
            )));
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StorageError::provider("mock", operation, "scripted failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for MockRemote {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.calls.gets.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Ok(None);
        }
        self.check_failure("get")?;
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value, _options: Option<SetOptions>) -> Result<()> {
        self.calls.sets.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Ok(());
        }
        self.check_failure("set")?;
        self.records.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.calls.deletes.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Ok(false);
        }
        self.check_failure("delete")?;
        Ok(self.records.lock().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if !self.is_available() {
            return Ok(false);
        }
        Ok(self.records.lock().await.contains_key(key))
    }

    async fn clear(&self) -> Result<()> {
        self.records.lock().await.clear();
        Ok(())
    }

    async fn list(&self, prefix: Option<&str>, limit: Option<usize>) -> Result<Vec<String>> {
        self.calls.lists.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Ok(Vec::new());
        }
        self.check_failure("list")?;
        let records = self.records.lock().await;
        let mut keys: Vec<String> = records
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
        self.calls.searches.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Ok(Vec::new());
        }
        self.check_failure("search")?;
        let records = self.records.lock().await;
        let mut hits: Vec<SearchHit> = records
            .iter()
            .filter_map(|(key, value)| {
                score_value(query, value).map(|score| SearchHit {
                    key: key.clone(),
                    score,
                    value: value.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(query.limit);
        Ok(hits)
    }

    async fn stats(&self) -> Result<ProviderStats> {
        let records = self.records.lock().await;
        Ok(ProviderStats {
            entry_count: records.len(),
            newest_entry: (!records.is_empty()).then(now_millis),
            ..Default::default()
        }
        .finalize())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn changes_since(
        &self,
        agent_id: &str,
        since: Option<i64>,
    ) -> Result<Option<Vec<IncrementalUpdate>>> {
        self.calls.changes.fetch_add(1, Ordering::SeqCst);
        if !self.is_available() {
            return Ok(None);
        }
        self.check_failure("changes_since")?;
        let watermark = since.unwrap_or(i64::MIN);
        let feed = self.changes_feed.lock().await;
        let matching: Vec<IncrementalUpdate> = feed
            .iter()
            .filter(|u| u.timestamp > watermark)
            .filter(|u| {
                u.data
                    .as_ref()
                    .and_then(|d| d.get("agentId"))
                    .and_then(Value::as_str)
                    .map(|a| a == agent_id)
                    // Deletes carry no payload; deliver them to every agent.
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        Ok(Some(matching))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UpdateKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_counts_calls() {
        let mock = MockRemote::new();
        mock.get("k").await.unwrap();
        mock.get("k").await.unwrap();
        mock.set("k", json!(1), None).await.unwrap();
        assert_eq!(mock.calls.gets.load(Ordering::SeqCst), 2);
        assert_eq!(mock.calls.sets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scripted_failure() {
        let mock = MockRemote::new();
        mock.fail_all(true);
        assert!(mock.get("k").await.is_err());
        mock.fail_all(false);
        assert!(mock.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_degrades() {
        let mock = MockRemote::new();
        mock.seed("k", json!(1)).await;
        mock.set_available(false);
        assert_eq!(mock.get("k").await.unwrap(), None);
        assert!(mock.changes_since("a1", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changes_feed_watermark() {
        let mock = MockRemote::new();
        for (ts, id) in [(100, "s1"), (200, "s2")] {
            mock.push_change(IncrementalUpdate {
                session_id: id.into(),
                kind: UpdateKind::Update,
                data: Some(json!({"agentId": "a1", "id": id})),
                version: 2,
                timestamp: ts,
                checksum: String::new(),
            })
            .await;
        }
        let updates = mock.changes_since("a1", Some(150)).await.unwrap().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].session_id, "s2");
    }
}
