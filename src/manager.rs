//! Storage Manager: the engine's public facade
//!
//! Owns the three providers, the cache manager, and the sync manager, and
//! exposes the session-level operations everything else is built for. All
//! collaborators are injected at construction; there are no globals.

use crate::cache::CacheManager;
use crate::config::{RemoteConfig, StorageConfig};
use crate::connectivity::ConnectivityObserver;
use crate::errors::{Result, StorageError};
use crate::keys::{SESSION_PREFIX, StoreKey};
use crate::provider::file::FileStore;
use crate::provider::memory::MemoryStore;
use crate::provider::remote::HttpRemote;
use crate::provider::{SearchHit, SearchQuery, StorageProvider};
use crate::sync::SyncManager;
use crate::telemetry::{AccessEvent, AccessTier, NoopTelemetry, TelemetrySink};
use crate::types::{Message, Session, SessionSummary, Temperature, now_millis};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const HOT_ACCESS_WINDOW_MS: i64 = 60 * 60 * 1000;
const WARM_UPDATE_WINDOW_MS: i64 = 24 * 60 * 60 * 1000;

/// Per-provider health probe outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    /// Volatile tier passed its probe
    pub volatile: bool,
    /// Durable tier passed its probe
    pub durable: bool,
    /// Remote tier passed its probe
    pub remote: bool,
    /// Conjunction of the per-provider results
    pub healthy: bool,
}

/// Orchestrates the cache and sync managers over the three tiers.
///
/// Construct with [`new`](Self::new) for the default provider stack, or
/// [`with_providers`](Self::with_providers) to inject your own (tests use
/// [`MockRemote`](crate::provider::mock::MockRemote) as the remote tier).
/// Call [`init`](Self::init) once before use; it is idempotent.
pub struct StorageManager {
    config: StorageConfig,
    volatile: Arc<dyn StorageProvider>,
    durable: Arc<dyn StorageProvider>,
    remote: Arc<dyn StorageProvider>,
    cache: Arc<CacheManager>,
    sync: Arc<SyncManager>,
    telemetry: Arc<dyn TelemetrySink>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    background_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl StorageManager {
    /// Build the default stack: in-memory volatile tier, file-backed durable
    /// tier under `config.storage.data_dir`, HTTP remote from
    /// `TIERSTORE_REMOTE_URL`. Must be called inside a tokio runtime.
    pub fn new(config: StorageConfig) -> Result<Arc<Self>> {
        let remote: Arc<dyn StorageProvider> =
            Arc::new(HttpRemote::new(RemoteConfig::from_env()?)?);
        let volatile: Arc<dyn StorageProvider> =
            Arc::new(MemoryStore::new(config.cache.memory.clone()));
        let durable: Arc<dyn StorageProvider> = Arc::new(FileStore::new(
            config.storage.data_dir.clone(),
            config.cache.durable.clone(),
        ));
        Ok(Self::with_providers(
            config,
            volatile,
            durable,
            remote,
            Arc::new(NoopTelemetry),
        ))
    }

    /// Build with injected providers and telemetry sink.
    pub fn with_providers(
        config: StorageConfig,
        volatile: Arc<dyn StorageProvider>,
        durable: Arc<dyn StorageProvider>,
        remote: Arc<dyn StorageProvider>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        let sink: Arc<dyn TelemetrySink> = if config.performance.enable_monitoring {
            telemetry
        } else {
            Arc::new(NoopTelemetry)
        };
        let cache = Arc::new(
            CacheManager::new(
                Arc::clone(&volatile),
                Arc::clone(&durable),
                config.cache.clone(),
                Arc::clone(&sink),
            )
            .with_compression_threshold(config.performance.compression_threshold),
        );
        let sync = SyncManager::new(
            Arc::clone(&volatile),
            Arc::clone(&durable),
            Arc::clone(&remote),
            config.sync.clone(),
            Arc::clone(&sink),
        );
        Arc::new(Self {
            config,
            volatile,
            durable,
            remote,
            cache,
            sync,
            telemetry: sink,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            background_tasks: Mutex::new(Vec::new()),
        })
    }

    /// One-time initialization: providers, persisted sync state, background
    /// tasks, auto-sync. Safe to call more than once; later calls no-op.
    pub async fn init(&self) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.volatile.init().await?;
        self.durable.init().await?;
        // Remote unavailability is a degraded state, not a startup failure.
        if let Err(e) = self.remote.init().await {
            warn!(error = %e, "remote tier init failed, starting degraded");
        }
        self.sync.init().await?;

        if self.config.performance.enable_optimizations {
            self.spawn_maintenance_tasks().await;
        }
        if self.config.performance.enable_monitoring {
            self.spawn_monitoring_task().await;
        }
        if self.config.sync.auto_sync {
            Arc::clone(&self.sync).start_auto_sync().await;
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            data_dir = %self.config.storage.data_dir.display(),
            "storage manager initialized"
        );
        Ok(())
    }

    async fn spawn_maintenance_tasks(&self) {
        let cleanup_interval = self.config.storage.cleanup_interval;
        let cache = Arc::clone(&self.cache);
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.cleanup().await;
            }
        });

        let cache = Arc::clone(&self.cache);
        let optimize = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval * 2);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.optimize().await;
            }
        });

        let mut tasks = self.background_tasks.lock().await;
        tasks.push(cleanup);
        tasks.push(optimize);
    }

    /// Periodic cache metrics snapshot, logged at the monitoring interval.
    async fn spawn_monitoring_task(&self) {
        let interval = self.config.performance.monitoring_interval;
        let cache = Arc::clone(&self.cache);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let metrics = cache.metrics().await;
                debug!(
                    hits = metrics.hits,
                    misses = metrics.misses,
                    evictions = metrics.evictions,
                    promotions = metrics.promotions,
                    avg_response_ms = metrics.average_response_time_ms,
                    "cache metrics snapshot"
                );
            }
        });
        self.background_tasks.lock().await.push(task);
    }

    /// Route connectivity transitions into the sync manager's offline mode.
    pub async fn attach_connectivity(&self, observer: &ConnectivityObserver) {
        let mut rx = observer.subscribe();
        let sync = Arc::clone(&self.sync);
        let task = tokio::spawn(async move {
            loop {
                let online = *rx.borrow_and_update();
                sync.set_offline(!online).await;
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
        self.background_tasks.lock().await.push(task);
    }

    // ---- session operations -----------------------------------------------

    /// Fetch a session: local tiers first (read-through promotion handled by
    /// the cache), then the remote tier with a full local save on hit.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let key = StoreKey::session(session_id).encode();

        if let Some(value) = self.cache.get(&key).await {
            return Ok(Some(serde_json::from_value(value)?));
        }

        if !self.remote.is_available() {
            return Ok(None);
        }
        let started = Instant::now();
        let fetched = self.remote.get(&key).await;
        self.telemetry.record_access(AccessEvent {
            tier: AccessTier::Remote,
            duration: started.elapsed(),
            hit: matches!(fetched, Ok(Some(_))),
            size: None,
        });
        let Some(value) = fetched? else {
            return Ok(None);
        };

        let mut session: Session = serde_json::from_value(value)?;
        session.last_accessed_at = now_millis();
        let value = serde_json::to_value(&session)?;
        self.cache.set(&key, value, Some(Temperature::Hot)).await;
        debug!(session_id, "session restored from remote tier");
        Ok(Some(session))
    }

    /// Persist a session locally and queue it for reconciliation. Stamps
    /// `updated_at` and `last_accessed_at`; the version is only ever bumped
    /// by reconciliation.
    pub async fn save_session(&self, mut session: Session) -> Result<Session> {
        let now = now_millis();
        session.updated_at = now;
        session.last_accessed_at = now;

        let key = StoreKey::session(&session.id).encode();
        let value = serde_json::to_value(&session)?;
        let temperature = classify_session(&session, now);
        self.cache.set(&key, value, Some(temperature)).await;
        self.sync.mark_pending(&session.id).await;
        Ok(session)
    }

    /// Append a message to a session and save it.
    pub async fn add_message(&self, session_id: &str, message: Message) -> Result<Session> {
        let mut session = self.get_session(session_id).await?.ok_or_else(|| {
            StorageError::Validation(format!("unknown session: {session_id}"))
        })?;
        session.push_message(message);
        self.save_session(session).await
    }

    /// Delete a session from both local tiers. The remote record is left in
    /// place and is never touched by the pending queue; a session queued
    /// here would be recreated by the next pull delta.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let key = StoreKey::session(session_id).encode();
        let removed = self.cache.delete(&key).await;
        self.sync.forget_session(session_id).await;
        Ok(removed)
    }

    /// All sessions of one agent, local and remote merged, newest first.
    pub async fn get_agent_sessions(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = Vec::new();
        let mut seen_ids: std::collections::HashSet<String> = std::collections::HashSet::new();

        for key in self.durable.list(Some(SESSION_PREFIX), None).await? {
            let Some(value) = self.durable.get(&key).await? else {
                continue;
            };
            if value.get("agentId").and_then(Value::as_str) != Some(agent_id) {
                continue;
            }
            match serde_json::from_value::<Session>(value) {
                Ok(session) => {
                    seen_ids.insert(session.id.clone());
                    if let Some(remote_id) = &session.remote_id {
                        seen_ids.insert(remote_id.clone());
                    }
                    summaries.push(session.summary());
                }
                Err(e) => warn!(key, error = %e, "unreadable session skipped in listing"),
            }
        }

        if self.remote.is_available() {
            let query = SearchQuery::for_agent(agent_id);
            match self.remote.search(&query).await {
                Ok(hits) => {
                    for hit in hits {
                        let Ok(session) = serde_json::from_value::<Session>(hit.value) else {
                            continue;
                        };
                        // A remote record already represented locally (by id
                        // or by remote link) is not listed twice.
                        if seen_ids.contains(&session.id)
                            || session
                                .remote_id
                                .as_ref()
                                .is_some_and(|rid| seen_ids.contains(rid))
                        {
                            continue;
                        }
                        seen_ids.insert(session.id.clone());
                        summaries.push(session.summary());
                    }
                }
                Err(e) => warn!(error = %e, "remote listing failed, returning local only"),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }

    /// Search sessions across the durable and remote tiers, merged per key
    /// keeping the higher score.
    pub async fn search_sessions(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        for hit in self.durable.search(query).await? {
            merged.insert(hit.key.clone(), hit);
        }
        if self.remote.is_available() {
            match self.remote.search(query).await {
                Ok(hits) => {
                    for hit in hits {
                        match merged.get(&hit.key) {
                            Some(existing) if existing.score >= hit.score => {}
                            _ => {
                                merged.insert(hit.key.clone(), hit);
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "remote search failed, returning local only"),
            }
        }

        let mut hits: Vec<SearchHit> = merged.into_values().collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(query.limit);
        Ok(hits)
    }

    // ---- health / lifecycle -----------------------------------------------

    /// Probe each provider with a write/read/delete round trip under a
    /// throwaway key.
    pub async fn health_check(&self) -> HealthReport {
        let (volatile, durable, remote) = tokio::join!(
            probe_provider(self.volatile.as_ref()),
            probe_provider(self.durable.as_ref()),
            probe_provider(self.remote.as_ref()),
        );
        HealthReport {
            volatile,
            durable,
            remote,
            healthy: volatile && durable && remote,
        }
    }

    /// The cache manager, for direct inspection (metrics, preload).
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// The sync manager, for sync control and subscriptions.
    pub fn sync(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    /// The active configuration.
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Stop background work and release providers. The manager must not be
    /// used afterwards.
    pub async fn shutdown(&self) {
        for task in self.background_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.sync.stop_auto_sync().await;
        self.cache.shutdown().await;

        for provider in [&self.volatile, &self.durable, &self.remote] {
            if let Err(e) = provider.destroy().await {
                warn!(provider = provider.name(), error = %e, "provider destroy failed");
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!("storage manager shut down");
    }
}

/// Session-specific temperature: recently read sessions are hot, recently
/// edited ones warm, the rest cold.
fn classify_session(session: &Session, now: i64) -> Temperature {
    if now - session.last_accessed_at < HOT_ACCESS_WINDOW_MS {
        Temperature::Hot
    } else if now - session.updated_at < WARM_UPDATE_WINDOW_MS {
        Temperature::Warm
    } else {
        Temperature::Cold
    }
}

async fn probe_provider(provider: &dyn StorageProvider) -> bool {
    if !provider.is_available() {
        return false;
    }
    let key = StoreKey::Probe(uuid::Uuid::new_v4().to_string()).encode();
    let value = serde_json::json!({"probe": true, "at": now_millis()});

    let wrote = match provider.set(&key, value, None).await {
        Ok(()) => true,
        Err(e) => {
            warn!(provider = provider.name(), error = %e, "health probe write failed");
            false
        }
    };
    if !wrote {
        return false;
    }
    let read_ok = matches!(provider.get(&key).await, Ok(Some(_)));
    let deleted = provider.delete(&key).await.is_ok();
    read_ok && deleted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_session_windows() {
        let now = now_millis();
        let mut session = Session::new("s1", "a1", "t");

        session.last_accessed_at = now - 10_000;
        session.updated_at = now - 10_000;
        assert_eq!(classify_session(&session, now), Temperature::Hot);

        session.last_accessed_at = now - 2 * HOT_ACCESS_WINDOW_MS;
        session.updated_at = now - 2 * HOT_ACCESS_WINDOW_MS;
        assert_eq!(classify_session(&session, now), Temperature::Warm);

        session.last_accessed_at = now - 2 * WARM_UPDATE_WINDOW_MS;
        session.updated_at = now - 2 * WARM_UPDATE_WINDOW_MS;
        assert_eq!(classify_session(&session, now), Temperature::Cold);
    }
}
