//! Cache Manager: tiering between the volatile and durable providers
//!
//! Decides, per key, whether data lives in the volatile tier, the durable
//! tier, or both, driven by a HOT/WARM/COLD temperature classification, and
//! keeps the volatile tier bounded through promotion, demotion, and
//! eviction. Provider failures never propagate to callers: a failed read is
//! a miss, a failed write is logged and swallowed, because a cache problem
//! must not break a user-facing read or save.
//!
//! Preloading runs on a dedicated worker task fed through a channel, so a
//! double miss can fire-and-forget a related preload without blocking the
//! caller. One batch runs at a time; requests arriving while the worker is
//! busy are queued, deduplicated, and drained five keys at a time in
//! priority order.

use crate::config::{CacheConfig, PerformanceConfig};
use crate::errors::Result;
use crate::keys::SESSION_PREFIX;
use crate::provider::{SetOptions, StorageProvider};
use crate::telemetry::{AccessEvent, AccessTier, TelemetrySink};
use crate::types::{CacheEntry, CacheTier, Temperature, now_millis};
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, warn};

/// Volatile-tier usage ratio above which WARM writes skip the volatile tier
/// and optimization rebalances.
const VOLATILE_PRESSURE: f64 = 0.8;
/// Keys preloaded concurrently when draining the queue.
const PRELOAD_CHUNK: usize = 5;
/// Preload history is cleared once it grows past this.
const PRELOAD_HISTORY_CAP: usize = 1000;
/// Durable entry count the optimizer trims down to.
const DURABLE_OPTIMIZE_CAP: usize = 1000;
/// Volatile entries demoted per optimization pass under pressure.
const REBALANCE_DEMOTIONS: usize = 20;

const HOT_SIZE_LIMIT: usize = 10 * 1024;
const WARM_SIZE_LIMIT: usize = 100 * 1024;
const HOT_ACCESS_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;
const WARM_ACCESS_WINDOW_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// Cumulative cache counters plus a smoothed response-time average.
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
    /// Reads served from either local tier
    pub hits: u64,
    /// Reads that missed both local tiers
    pub misses: u64,
    /// Entries evicted from the volatile tier
    pub evictions: u64,
    /// Durable-to-volatile promotions
    pub promotions: u64,
    /// Volatile-to-durable demotions
    pub demotions: u64,
    /// Keys warmed by the preload worker
    pub preloads: u64,
    /// Total `get` calls
    pub total_requests: u64,
    /// Exponentially smoothed response time (smoothing factor 0.1)
    pub average_response_time_ms: f64,
}

impl CacheMetrics {
    fn record_response_time(&mut self, ms: f64) {
        if self.total_requests <= 1 {
            self.average_response_time_ms = ms;
        } else {
            self.average_response_time_ms += 0.1 * (ms - self.average_response_time_ms);
        }
    }
}

enum PreloadRequest {
    /// Warm these keys into the volatile tier.
    Keys(Vec<String>),
    /// A double miss on this key; warm its neighbors.
    Related(String),
}

struct PreloadShared {
    busy: AtomicBool,
    history: Mutex<HashSet<String>>,
}

/// Two-tier cache manager over the volatile and durable providers.
pub struct CacheManager {
    volatile: Arc<dyn StorageProvider>,
    durable: Arc<dyn StorageProvider>,
    config: CacheConfig,
    compression_threshold: usize,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Arc<RwLock<CacheMetrics>>,
    entries: Arc<RwLock<HashMap<String, CacheEntry>>>,
    preload_tx: mpsc::UnboundedSender<PreloadRequest>,
    preload_shared: Arc<PreloadShared>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl CacheManager {
    /// Create a manager and spawn its preload worker.
    pub fn new(
        volatile: Arc<dyn StorageProvider>,
        durable: Arc<dyn StorageProvider>,
        config: CacheConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let (preload_tx, preload_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(RwLock::new(CacheMetrics::default()));
        let entries = Arc::new(RwLock::new(HashMap::new()));
        let preload_shared = Arc::new(PreloadShared {
            busy: AtomicBool::new(false),
            history: Mutex::new(HashSet::new()),
        });

        let worker = PreloadWorker {
            rx: preload_rx,
            volatile: volatile.clone(),
            durable: durable.clone(),
            metrics: metrics.clone(),
            shared: preload_shared.clone(),
        };
        let handle = tokio::spawn(worker.run());

        Self {
            volatile,
            durable,
            config,
            compression_threshold: PerformanceConfig::default().compression_threshold,
            telemetry,
            metrics,
            entries,
            preload_tx,
            preload_shared,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Override the serialized size at or above which durable writes carry
    /// a compress-at-rest hint. Zero disables the hint.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Read a key: volatile tier first, then durable with read-through
    /// promotion, then a recorded miss that fire-and-forgets a related
    /// preload. Never errors; provider failures count as misses.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let started = Instant::now();

        match self.volatile.get(key).await {
            Ok(Some(value)) => {
                self.finish_read(key, started, true, AccessTier::Volatile, Some(&value))
                    .await;
                return Some(value);
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "volatile read failed, treating as miss"),
        }

        match self.durable.get(key).await {
            Ok(Some(value)) => {
                // Read-through promotion into the volatile tier.
                if let Err(e) = self.volatile.set(key, value.clone(), None).await {
                    warn!(key, error = %e, "promotion write failed");
                } else {
                    self.metrics.write().await.promotions += 1;
                }
                self.finish_read(key, started, true, AccessTier::Durable, Some(&value))
                    .await;
                self.track_entry(key, Temperature::Warm, &value, CacheTier::Both)
                    .await;
                return Some(value);
            }
            Ok(None) => {}
            Err(e) => warn!(key, error = %e, "durable read failed, treating as miss"),
        }

        self.finish_read(key, started, false, AccessTier::Durable, None)
            .await;
        // Fire and forget; the worker decides what "related" means.
        let _ = self.preload_tx.send(PreloadRequest::Related(key.to_string()));
        None
    }

    async fn finish_read(
        &self,
        key: &str,
        started: Instant,
        hit: bool,
        tier: AccessTier,
        value: Option<&Value>,
    ) {
        let elapsed = started.elapsed();
        {
            let mut metrics = self.metrics.write().await;
            metrics.total_requests += 1;
            if hit {
                metrics.hits += 1;
            } else {
                metrics.misses += 1;
            }
            metrics.record_response_time(elapsed.as_secs_f64() * 1000.0);
        }
        if hit {
            if let Some(entry) = self.entries.write().await.get_mut(key) {
                entry.touch();
            }
        }
        self.telemetry.record_access(AccessEvent {
            tier,
            duration: elapsed,
            hit,
            size: value.map(serialized_size),
        });
    }

    /// Write a key, classifying its temperature unless one is supplied.
    /// HOT lands in both tiers, WARM in the durable tier (plus volatile
    /// while usage stays under 80%), COLD in the durable tier only. Values
    /// at or above the compression threshold carry a compress hint on the
    /// durable write.
    pub async fn set(&self, key: &str, value: Value, temperature: Option<Temperature>) {
        let temperature = temperature.unwrap_or_else(|| determine_temperature(key, &value));
        let options = self.write_options(&value);
        let tier = match temperature {
            Temperature::Hot => {
                let (v, d) = tokio::join!(
                    self.volatile.set(key, value.clone(), None),
                    self.durable.set(key, value.clone(), options),
                );
                if let Err(e) = v {
                    warn!(key, error = %e, "volatile write failed");
                }
                if let Err(e) = d {
                    warn!(key, error = %e, "durable write failed");
                }
                CacheTier::Both
            }
            Temperature::Warm => {
                if let Err(e) = self.durable.set(key, value.clone(), options).await {
                    warn!(key, error = %e, "durable write failed");
                }
                if self.volatile_usage().await < VOLATILE_PRESSURE {
                    if let Err(e) = self.volatile.set(key, value.clone(), None).await {
                        warn!(key, error = %e, "volatile write failed");
                    }
                    CacheTier::Both
                } else {
                    CacheTier::Durable
                }
            }
            Temperature::Cold => {
                if let Err(e) = self.durable.set(key, value.clone(), options).await {
                    warn!(key, error = %e, "durable write failed");
                }
                CacheTier::Durable
            }
        };
        self.track_entry(key, temperature, &value, tier).await;
    }

    /// Delete from both tiers. True when either tier removed a value.
    pub async fn delete(&self, key: &str) -> bool {
        let (v, d) = tokio::join!(self.volatile.delete(key), self.durable.delete(key));
        self.entries.write().await.remove(key);
        let deleted_v = v.unwrap_or_else(|e| {
            warn!(key, error = %e, "volatile delete failed");
            false
        });
        let deleted_d = d.unwrap_or_else(|e| {
            warn!(key, error = %e, "durable delete failed");
            false
        });
        deleted_v || deleted_d
    }

    /// Clear both tiers and all entry bookkeeping.
    pub async fn clear(&self) {
        let (v, d) = tokio::join!(self.volatile.clear(), self.durable.clear());
        if let Err(e) = v {
            warn!(error = %e, "volatile clear failed");
        }
        if let Err(e) = d {
            warn!(error = %e, "durable clear failed");
        }
        self.entries.write().await.clear();
    }

    /// Parallel multi-get.
    pub async fn mget(&self, keys: &[String]) -> Vec<Option<Value>> {
        join_all(keys.iter().map(|k| self.get(k))).await
    }

    /// Multi-set: classify each entry, then batch the volatile write for
    /// HOT∪WARM and the durable write for everything.
    pub async fn mset(&self, items: Vec<(String, Value)>) {
        let mut volatile_batch = Vec::new();
        let mut durable_batch = Vec::with_capacity(items.len());
        let mut tracked = Vec::with_capacity(items.len());

        for (key, value) in items {
            let temperature = determine_temperature(&key, &value);
            if matches!(temperature, Temperature::Hot | Temperature::Warm) {
                volatile_batch.push((key.clone(), value.clone()));
            }
            durable_batch.push((key.clone(), value.clone()));
            tracked.push((key, temperature, value));
        }

        let (v, d) = tokio::join!(
            self.volatile.mset(volatile_batch, None),
            self.durable.mset(durable_batch, None),
        );
        if let Err(e) = v {
            warn!(error = %e, "volatile batch write failed");
        }
        if let Err(e) = d {
            warn!(error = %e, "durable batch write failed");
        }

        for (key, temperature, value) in tracked {
            let tier = match temperature {
                Temperature::Cold => CacheTier::Durable,
                _ => CacheTier::Both,
            };
            self.track_entry(&key, temperature, &value, tier).await;
        }
    }

    /// Move a durable-resident value into the volatile tier, evicting
    /// first when the volatile tier is at capacity.
    pub async fn promote_to_hot(&self, key: &str) -> Result<bool> {
        let Some(value) = self.durable.get(key).await? else {
            return Ok(false);
        };

        let at_capacity = {
            let stats = self.volatile.stats().await?;
            stats.entry_count + 1 > self.config.memory.max_entries
        };
        if at_capacity {
            if self.volatile.supports_cleanup() {
                self.volatile.cleanup().await?;
            } else {
                self.evict_oldest_half().await;
            }
        }

        self.volatile.set(key, value.clone(), None).await?;
        self.metrics.write().await.promotions += 1;
        self.track_entry(key, Temperature::Hot, &value, CacheTier::Both)
            .await;
        Ok(true)
    }

    /// Drop a key from the volatile tier, leaving the durable copy intact.
    pub async fn demote_to_cold(&self, key: &str) {
        if let Err(e) = self.volatile.delete(key).await {
            warn!(key, error = %e, "demotion delete failed");
            return;
        }
        self.metrics.write().await.demotions += 1;
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            entry.temperature = Temperature::Cold;
            entry.tier = CacheTier::Durable;
        }
    }

    /// Pure tier-membership lookup: volatile → HOT, durable → WARM, else
    /// COLD. Does not re-derive temperature from content.
    pub async fn get_temperature(&self, key: &str) -> Temperature {
        if self.volatile.exists(key).await.unwrap_or(false) {
            Temperature::Hot
        } else if self.durable.exists(key).await.unwrap_or(false) {
            Temperature::Warm
        } else {
            Temperature::Cold
        }
    }

    /// Queue keys for preloading. Returns immediately; the worker drains
    /// the queue in priority order.
    pub fn preload(&self, keys: Vec<String>) {
        let _ = self.preload_tx.send(PreloadRequest::Keys(keys));
    }

    /// Whether a preload batch is currently being drained.
    pub fn is_preloading(&self) -> bool {
        self.preload_shared.busy.load(Ordering::SeqCst)
    }

    /// Delegate to each provider's own cleanup, drop bookkeeping for keys
    /// no tier holds anymore, and trim the preload history once it exceeds
    /// its cap.
    pub async fn cleanup(&self) {
        for provider in [&self.volatile, &self.durable] {
            if provider.supports_cleanup() {
                if let Err(e) = provider.cleanup().await {
                    warn!(provider = provider.name(), error = %e, "cleanup failed");
                }
            }
        }
        self.prune_stale_entries().await;
        let mut history = self.preload_shared.history.lock().await;
        if history.len() > PRELOAD_HISTORY_CAP {
            history.clear();
        }
    }

    /// Providers evict on their own (capacity, TTL), so the bookkeeping map
    /// is reconciled against actual tier membership here.
    async fn prune_stale_entries(&self) {
        let (v, d) = tokio::join!(
            self.volatile.list(None, None),
            self.durable.list(None, None),
        );
        match (v, d) {
            (Ok(volatile_keys), Ok(durable_keys)) => {
                let live: HashSet<String> =
                    volatile_keys.into_iter().chain(durable_keys).collect();
                self.entries.write().await.retain(|key, _| live.contains(key));
            }
            _ => warn!("tier listing failed, keeping entry bookkeeping as is"),
        }
    }

    /// Cleanup plus rebalancing: trim the durable tier back to its cap and
    /// demote the least-recently-used volatile entries under pressure.
    pub async fn optimize(&self) {
        self.cleanup().await;

        match self.durable.stats().await {
            Ok(stats) if stats.entry_count > DURABLE_OPTIMIZE_CAP => {
                let excess = stats.entry_count - DURABLE_OPTIMIZE_CAP;
                let victims = self.oldest_durable_keys(excess).await;
                let removed = match self.durable.mdelete(&victims).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "durable trim failed");
                        0
                    }
                };
                if removed > 0 {
                    self.metrics.write().await.evictions += removed as u64;
                    self.telemetry.record_eviction(AccessTier::Durable, removed);
                    let mut entries = self.entries.write().await;
                    for key in &victims {
                        entries.remove(key);
                    }
                    debug!(removed, "optimizer trimmed durable tier");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "durable stats unavailable"),
        }

        if self.volatile_usage().await > VOLATILE_PRESSURE {
            let victims = self.lru_volatile_keys(REBALANCE_DEMOTIONS).await;
            for key in &victims {
                self.demote_to_cold(key).await;
            }
            if !victims.is_empty() {
                debug!(demoted = victims.len(), "optimizer rebalanced volatile tier");
            }
        }
    }

    /// Snapshot of the cumulative metrics.
    pub async fn metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }

    /// Reset all counters to zero.
    pub async fn reset_metrics(&self) {
        *self.metrics.write().await = CacheMetrics::default();
    }

    /// Stop the preload worker.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().await.take() {
            handle.abort();
        }
    }

    fn write_options(&self, value: &Value) -> Option<SetOptions> {
        (self.compression_threshold > 0
            && serialized_size(value) >= self.compression_threshold)
            .then(|| SetOptions {
                compress: true,
                ..Default::default()
            })
    }

    async fn volatile_usage(&self) -> f64 {
        if self.config.memory.max_entries == 0 {
            return 1.0;
        }
        match self.volatile.stats().await {
            Ok(stats) => stats.entry_count as f64 / self.config.memory.max_entries as f64,
            Err(e) => {
                warn!(error = %e, "volatile stats unavailable, assuming pressure");
                1.0
            }
        }
    }

    async fn track_entry(&self, key: &str, temperature: Temperature, value: &Value, tier: CacheTier) {
        let size = serialized_size(value);
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.temperature = temperature;
                entry.size = size;
                entry.tier = tier;
                entry.last_accessed = now_millis();
            }
            None => {
                entries.insert(key.to_string(), CacheEntry::new(key, temperature, size, tier));
            }
        }
    }

    /// Delete the oldest half of the volatile tier. The blunt fallback for
    /// providers without their own cleanup.
    async fn evict_oldest_half(&self) {
        let keys = match self.volatile.list(None, None).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "volatile list failed, skipping eviction");
                return;
            }
        };
        if keys.is_empty() {
            return;
        }
        let mut ranked: Vec<(String, i64)> = {
            let entries = self.entries.read().await;
            keys.into_iter()
                .map(|k| {
                    let ts = entries.get(&k).map(|e| e.timestamp).unwrap_or(0);
                    (k, ts)
                })
                .collect()
        };
        ranked.sort_by_key(|(_, ts)| *ts);
        let victims: Vec<String> = ranked
            .iter()
            .take(ranked.len().div_ceil(2))
            .map(|(k, _)| k.clone())
            .collect();
        match self.volatile.mdelete(&victims).await {
            Ok(removed) => {
                self.metrics.write().await.evictions += removed as u64;
                self.telemetry.record_eviction(AccessTier::Volatile, removed);
                let mut entries = self.entries.write().await;
                for key in &victims {
                    entries.remove(key);
                }
            }
            Err(e) => warn!(error = %e, "volatile eviction failed"),
        }
    }

    async fn oldest_durable_keys(&self, count: usize) -> Vec<String> {
        let keys = self.durable.list(None, None).await.unwrap_or_default();
        let entries = self.entries.read().await;
        let mut ranked: Vec<(String, i64)> = keys
            .into_iter()
            .map(|k| {
                let ts = entries.get(&k).map(|e| e.timestamp).unwrap_or(0);
                (k, ts)
            })
            .collect();
        ranked.sort_by_key(|(_, ts)| *ts);
        ranked.into_iter().take(count).map(|(k, _)| k).collect()
    }

    async fn lru_volatile_keys(&self, count: usize) -> Vec<String> {
        let keys = self.volatile.list(None, None).await.unwrap_or_default();
        let entries = self.entries.read().await;
        let mut ranked: Vec<(String, i64)> = keys
            .into_iter()
            .map(|k| {
                let ts = entries.get(&k).map(|e| e.last_accessed).unwrap_or(0);
                (k, ts)
            })
            .collect();
        ranked.sort_by_key(|(_, ts)| *ts);
        ranked.into_iter().take(count).map(|(k, _)| k).collect()
    }
}

/// Classify a value's temperature. Rules applied in order: session values
/// with a `lastAccessedAt` stamp classify by access recency; keys carrying
/// a `current`/`active` marker are HOT; everything else classifies by
/// serialized size.
pub fn determine_temperature(key: &str, value: &Value) -> Temperature {
    if let Some(last_accessed) = value.get("lastAccessedAt").and_then(Value::as_i64) {
        let age = now_millis() - last_accessed;
        return if age <= HOT_ACCESS_WINDOW_MS {
            Temperature::Hot
        } else if age <= WARM_ACCESS_WINDOW_MS {
            Temperature::Warm
        } else {
            Temperature::Cold
        };
    }
    if key.contains("current") || key.contains("active") {
        return Temperature::Hot;
    }
    let size = serialized_size(value);
    if size < HOT_SIZE_LIMIT {
        Temperature::Hot
    } else if size < WARM_SIZE_LIMIT {
        Temperature::Warm
    } else {
        Temperature::Cold
    }
}

fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

/// Longest run of digits in a key, used to order preloads by recency when
/// keys embed a timestamp.
fn timestamp_hint(key: &str) -> i64 {
    let mut best: i64 = 0;
    let mut best_len = 0;
    let mut current: i64 = 0;
    let mut len = 0;
    for c in key.chars() {
        if let Some(d) = c.to_digit(10) {
            current = current.saturating_mul(10).saturating_add(d as i64);
            len += 1;
        } else {
            if len > best_len {
                best = current;
                best_len = len;
            }
            current = 0;
            len = 0;
        }
    }
    if len > best_len {
        best = current;
    }
    best
}

fn preload_rank(key: &str) -> (bool, i64) {
    // current/active keys first, then most recent timestamps.
    (
        !(key.contains("current") || key.contains("active")),
        -timestamp_hint(key),
    )
}

struct PreloadWorker {
    rx: mpsc::UnboundedReceiver<PreloadRequest>,
    volatile: Arc<dyn StorageProvider>,
    durable: Arc<dyn StorageProvider>,
    metrics: Arc<RwLock<CacheMetrics>>,
    shared: Arc<PreloadShared>,
}

impl PreloadWorker {
    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            self.shared.busy.store(true, Ordering::SeqCst);
            let mut queue: VecDeque<String> = VecDeque::new();
            let mut queued: HashSet<String> = HashSet::new();
            self.absorb(request, &mut queue, &mut queued).await;

            loop {
                // Requests that arrived while this batch was running join
                // the same drain instead of starting a second one.
                while let Ok(more) = self.rx.try_recv() {
                    self.absorb(more, &mut queue, &mut queued).await;
                }
                if queue.is_empty() {
                    break;
                }
                let mut pending: Vec<String> = queue.drain(..).collect();
                pending.sort_by_key(|k| preload_rank(k));
                let chunk: Vec<String> = pending
                    .drain(..pending.len().min(PRELOAD_CHUNK))
                    .collect();
                queue.extend(pending);

                join_all(chunk.iter().map(|key| self.load(key))).await;
            }
            self.shared.busy.store(false, Ordering::SeqCst);
        }
    }

    async fn absorb(
        &self,
        request: PreloadRequest,
        queue: &mut VecDeque<String>,
        queued: &mut HashSet<String>,
    ) {
        let keys = match request {
            PreloadRequest::Keys(keys) => keys,
            PreloadRequest::Related(missed) => self.related_keys(&missed).await,
        };
        let history = self.shared.history.lock().await;
        for key in keys {
            if history.contains(&key) || !queued.insert(key.clone()) {
                continue;
            }
            queue.push_back(key);
        }
    }

    /// Neighbors of a missed session key: other session records still in
    /// the durable tier.
    async fn related_keys(&self, missed: &str) -> Vec<String> {
        if !missed.starts_with(SESSION_PREFIX) {
            return Vec::new();
        }
        match self.durable.list(Some(SESSION_PREFIX), Some(10)).await {
            Ok(keys) => keys.into_iter().filter(|k| k != missed).collect(),
            Err(e) => {
                debug!(error = %e, "related-key listing failed");
                Vec::new()
            }
        }
    }

    async fn load(&self, key: &str) {
        {
            let mut history = self.shared.history.lock().await;
            if history.len() > PRELOAD_HISTORY_CAP {
                history.clear();
            }
            history.insert(key.to_string());
        }
        if self.volatile.exists(key).await.unwrap_or(false) {
            return;
        }
        match self.durable.get(key).await {
            Ok(Some(value)) => {
                if let Err(e) = self.volatile.set(key, value, None).await {
                    debug!(key, error = %e, "preload write failed");
                } else {
                    self.metrics.write().await.preloads += 1;
                }
            }
            Ok(None) => {}
            Err(e) => debug!(key, error = %e, "preload read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use crate::provider::memory::MemoryStore;
    use crate::telemetry::NoopTelemetry;
    use serde_json::json;

    fn tiered(volatile_entries: usize) -> (CacheManager, Arc<MemoryStore>, Arc<MemoryStore>) {
        let memory = TierConfig {
            max_entries: volatile_entries,
            ttl: None,
            ..TierConfig::volatile_default()
        };
        let volatile = Arc::new(MemoryStore::new(memory.clone()));
        let durable = Arc::new(MemoryStore::new(TierConfig::durable_default()));
        let config = CacheConfig {
            memory,
            durable: TierConfig::durable_default(),
        };
        let cache = CacheManager::new(
            volatile.clone(),
            durable.clone(),
            config,
            Arc::new(NoopTelemetry),
        );
        (cache, volatile, durable)
    }

    #[tokio::test]
    async fn test_cleanup_drops_bookkeeping_for_provider_evicted_keys() {
        let (cache, volatile, durable) = tiered(10);
        cache
            .set("session:a", json!({"data": "x"}), Some(Temperature::Hot))
            .await;
        cache
            .set("session:b", json!({"data": "y"}), Some(Temperature::Hot))
            .await;

        // A provider dropping a key on its own looks like a capacity or
        // TTL eviction from the manager's point of view.
        volatile.delete("session:a").await.unwrap();
        durable.delete("session:a").await.unwrap();

        cache.cleanup().await;
        let entries = cache.entries.read().await;
        assert!(!entries.contains_key("session:a"));
        assert!(entries.contains_key("session:b"));
    }

    #[tokio::test]
    async fn test_eviction_removes_bookkeeping_entries() {
        let (cache, volatile, _durable) = tiered(10);
        for i in 0..4 {
            cache
                .set(&format!("session:{i}"), json!({"n": i}), Some(Temperature::Hot))
                .await;
        }
        cache.evict_oldest_half().await;
        assert_eq!(volatile.stats().await.unwrap().entry_count, 2);
        assert_eq!(cache.entries.read().await.len(), 2);
        assert_eq!(cache.metrics().await.evictions, 2);
    }

    #[tokio::test]
    async fn test_optimize_trim_drops_bookkeeping_for_trimmed_keys() {
        let (cache, _volatile, durable) = tiered(2000);
        for i in 0..1010 {
            cache
                .set(&format!("blob:{i:04}"), json!(i), Some(Temperature::Cold))
                .await;
        }
        cache.optimize().await;
        assert_eq!(durable.stats().await.unwrap().entry_count, 1000);
        assert_eq!(cache.entries.read().await.len(), 1000);
    }

    #[tokio::test]
    async fn test_large_values_carry_compress_hint() {
        let (cache, _volatile, _durable) = tiered(10);
        let cache = cache.with_compression_threshold(1024);
        let small = json!({"data": "x"});
        let large = json!({"data": "x".repeat(4096)});
        assert!(cache.write_options(&small).is_none());
        assert!(cache.write_options(&large).unwrap().compress);

        let (disabled, _v, _d) = tiered(10);
        let disabled = disabled.with_compression_threshold(0);
        assert!(disabled.write_options(&large).is_none());
    }

    #[test]
    fn test_temperature_by_access_recency() {
        let hour = 60 * 60 * 1000;
        let fresh = json!({"lastAccessedAt": now_millis() - hour});
        let recent = json!({"lastAccessedAt": now_millis() - 3 * 24 * hour});
        let stale = json!({"lastAccessedAt": now_millis() - 30 * 24 * hour});

        assert_eq!(determine_temperature("session:a", &fresh), Temperature::Hot);
        assert_eq!(determine_temperature("session:a", &recent), Temperature::Warm);
        assert_eq!(determine_temperature("session:a", &stale), Temperature::Cold);
    }

    #[test]
    fn test_temperature_current_marker_wins_over_size() {
        let value = json!({"data": "x".repeat(200 * 1024)});
        assert_eq!(
            determine_temperature("session:current", &value),
            Temperature::Hot
        );
    }

    #[test]
    fn test_temperature_by_size() {
        let small = json!({"data": "x"});
        let medium = json!({"data": "x".repeat(50 * 1024)});
        let large = json!({"data": "x".repeat(200 * 1024)});
        assert_eq!(determine_temperature("blob:1", &small), Temperature::Hot);
        assert_eq!(determine_temperature("blob:2", &medium), Temperature::Warm);
        assert_eq!(determine_temperature("blob:3", &large), Temperature::Cold);
    }

    #[test]
    fn test_timestamp_hint_takes_longest_run() {
        assert_eq!(timestamp_hint("session:1700000000000"), 1_700_000_000_000);
        assert_eq!(timestamp_hint("v2:session:1700000000000"), 1_700_000_000_000);
        assert_eq!(timestamp_hint("no-digits"), 0);
    }

    #[test]
    fn test_preload_rank_orders_current_first() {
        let mut keys = vec![
            "session:100".to_string(),
            "session:900".to_string(),
            "session:current".to_string(),
        ];
        keys.sort_by_key(|k| preload_rank(k));
        assert_eq!(keys[0], "session:current");
        assert_eq!(keys[1], "session:900");
        assert_eq!(keys[2], "session:100");
    }

    #[test]
    fn test_metrics_smoothing() {
        let mut metrics = CacheMetrics::default();
        metrics.total_requests = 1;
        metrics.record_response_time(10.0);
        assert!((metrics.average_response_time_ms - 10.0).abs() < f64::EPSILON);

        metrics.total_requests = 2;
        metrics.record_response_time(20.0);
        // 10 + 0.1 * (20 - 10)
        assert!((metrics.average_response_time_ms - 11.0).abs() < 1e-9);
    }
}
