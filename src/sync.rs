//! Sync Manager: reconciling local tiers against the remote system of record
//!
//! Reconciliation happens per session and in agent-scoped batches. Each
//! session sync is a staged state machine with progress events; divergence
//! between local and remote records is detected by version comparison and
//! resolved by policy. Failures surface as structured results rather than
//! errors so batch sync continues past individual sessions.
//!
//! Offline mode is the designed fallback for sustained remote
//! unavailability: pending work accumulates and is flushed when
//! connectivity returns.

use crate::errors::{Result, StorageError};
use crate::keys::{SESSION_PREFIX, SYNC_PREFIX, StoreKey};
use crate::provider::{SearchQuery, StorageProvider};
use crate::telemetry::{Alert, RetryConfig, SyncEvent, TelemetrySink};
use crate::types::{
    BatchSyncResult, ConflictResolution, ConflictStrategy, ConflictType, IncrementalUpdate,
    Session, SyncConflict, SyncErrorEvent, SyncPolicy, SyncPolicyUpdate, SyncProgress,
    SyncResult, SyncStatus, UpdateKind, now_millis,
};
use futures::future::join_all;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Stable code attached to structured sync failures.
pub const SYNC_FAILED: &str = "SYNC_FAILED";

/// Handle returned by the subscribe methods; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct ListenerRegistry<E> {
    next_id: AtomicU64,
    listeners: std::sync::Mutex<HashMap<u64, Box<dyn Fn(&E) + Send + Sync>>>,
}

impl<E> ListenerRegistry<E> {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn subscribe(&self, listener: Box<dyn Fn(&E) + Send + Sync>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().expect("listener lock").insert(id, listener);
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners
            .lock()
            .expect("listener lock")
            .remove(&id.0)
            .is_some()
    }

    fn notify(&self, event: &E) {
        for listener in self.listeners.lock().expect("listener lock").values() {
            listener(event);
        }
    }
}

/// Counters returned by the delta application step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Sessions created locally from remote records
    pub created: usize,
    /// Sessions whose remote content was merged into the local record
    pub updated: usize,
    /// Sessions deleted locally because the remote record is gone
    pub deleted: usize,
}

/// Reconciles local (volatile + durable) session state with the remote
/// provider.
pub struct SyncManager {
    volatile: Arc<dyn StorageProvider>,
    durable: Arc<dyn StorageProvider>,
    remote: Arc<dyn StorageProvider>,
    telemetry: Arc<dyn TelemetrySink>,
    policy: RwLock<SyncPolicy>,
    statuses: RwLock<HashMap<String, SyncStatus>>,
    pending: RwLock<HashSet<String>>,
    in_flight: RwLock<HashSet<String>>,
    open_conflicts: RwLock<HashMap<String, SyncConflict>>,
    offline: AtomicBool,
    progress_listeners: ListenerRegistry<SyncProgress>,
    conflict_listeners: ListenerRegistry<SyncConflict>,
    error_listeners: ListenerRegistry<SyncErrorEvent>,
    auto_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncManager {
    /// Create a manager. Auto-sync starts only when
    /// [`start_auto_sync`](Self::start_auto_sync) is called (the storage
    /// manager does this when the policy asks for it).
    pub fn new(
        volatile: Arc<dyn StorageProvider>,
        durable: Arc<dyn StorageProvider>,
        remote: Arc<dyn StorageProvider>,
        policy: SyncPolicy,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            volatile,
            durable,
            remote,
            telemetry,
            policy: RwLock::new(policy),
            statuses: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashSet::new()),
            in_flight: RwLock::new(HashSet::new()),
            open_conflicts: RwLock::new(HashMap::new()),
            offline: AtomicBool::new(false),
            progress_listeners: ListenerRegistry::new(),
            conflict_listeners: ListenerRegistry::new(),
            error_listeners: ListenerRegistry::new(),
            auto_task: Mutex::new(None),
        })
    }

    /// Reload persisted per-session statuses from the durable tier.
    pub async fn init(&self) -> Result<()> {
        let keys = self.durable.list(Some(SYNC_PREFIX), None).await?;
        let mut statuses = self.statuses.write().await;
        for key in keys {
            let Some(StoreKey::SyncState(id)) = StoreKey::parse(&key) else {
                continue;
            };
            if let Some(value) = self.durable.get(&key).await? {
                match serde_json::from_value::<SyncStatus>(value) {
                    Ok(status) => {
                        statuses.insert(id, status);
                    }
                    Err(e) => warn!(key, error = %e, "unreadable persisted sync status"),
                }
            }
        }
        debug!(count = statuses.len(), "loaded persisted sync statuses");
        Ok(())
    }

    // ---- status -----------------------------------------------------------

    /// Current status for a session, derived by priority: explicit
    /// persisted status, else OFFLINE while offline mode is on, else
    /// PENDING when queued or actively syncing, else SYNCED.
    pub async fn sync_status(&self, session_id: &str) -> SyncStatus {
        if let Some(status) = self.statuses.read().await.get(session_id) {
            return *status;
        }
        if self.is_offline() {
            return SyncStatus::Offline;
        }
        if self.pending.read().await.contains(session_id)
            || self.in_flight.read().await.contains(session_id)
        {
            return SyncStatus::Pending;
        }
        SyncStatus::Synced
    }

    /// Mark a session as carrying unsynced local changes.
    pub async fn mark_pending(&self, session_id: &str) {
        // Any stale persisted status would mask the pending state.
        self.clear_status(session_id).await;
        self.pending.write().await.insert(session_id.to_string());
    }

    /// Drop all local sync state for a session: its place in the pending
    /// queue and any persisted status. Used when a session is deleted
    /// locally, where queueing it would let the pull delta recreate it.
    pub async fn forget_session(&self, session_id: &str) {
        self.pending.write().await.remove(session_id);
        self.clear_status(session_id).await;
    }

    /// Session ids currently queued for reconciliation.
    pub async fn pending_sessions(&self) -> Vec<String> {
        self.pending.read().await.iter().cloned().collect()
    }

    async fn set_status(&self, session_id: &str, status: SyncStatus) {
        self.statuses
            .write()
            .await
            .insert(session_id.to_string(), status);
        let key = StoreKey::sync_state(session_id).encode();
        match serde_json::to_value(status) {
            Ok(value) => {
                if let Err(e) = self.durable.set(&key, value, None).await {
                    warn!(session_id, error = %e, "failed to persist sync status");
                }
            }
            Err(e) => warn!(session_id, error = %e, "unserializable sync status"),
        }
    }

    async fn clear_status(&self, session_id: &str) {
        if self.statuses.write().await.remove(session_id).is_some() {
            let key = StoreKey::sync_state(session_id).encode();
            if let Err(e) = self.durable.delete(&key).await {
                warn!(session_id, error = %e, "failed to clear persisted sync status");
            }
        }
    }

    // ---- offline mode -----------------------------------------------------

    /// Whether offline mode is active.
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Toggle offline mode. Enabling keeps pending work queued; disabling
    /// flushes all pending sessions when the policy has auto-sync on.
    pub async fn set_offline(&self, offline: bool) {
        let was_offline = self.offline.swap(offline, Ordering::SeqCst);
        if was_offline && !offline && self.policy.read().await.auto_sync {
            debug!("back online, flushing pending sessions");
            self.flush_pending().await;
        }
    }

    /// Reconcile every pending session now.
    pub async fn flush_pending(&self) -> Vec<SyncResult> {
        let ids = self.pending_sessions().await;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(self.sync_session(&id).await);
        }
        results
    }

    // ---- policy / auto-sync ----------------------------------------------

    /// Current policy snapshot.
    pub async fn policy(&self) -> SyncPolicy {
        self.policy.read().await.clone()
    }

    /// Merge a partial policy update and re-arm the auto-sync timer.
    pub async fn update_policy(self: Arc<Self>, update: SyncPolicyUpdate) {
        {
            let mut policy = self.policy.write().await;
            if let Some(auto_sync) = update.auto_sync {
                policy.auto_sync = auto_sync;
            }
            if let Some(interval) = update.sync_interval {
                policy.sync_interval = interval;
            }
            if let Some(batch_size) = update.batch_size {
                policy.batch_size = batch_size;
            }
            if let Some(max_retries) = update.max_retries {
                policy.max_retries = max_retries;
            }
            if let Some(strategy) = update.conflict_resolution {
                policy.conflict_resolution = strategy;
            }
            if let Some(compress) = update.compress_data {
                policy.compress_data = compress;
            }
            if let Some(delta) = update.delta_sync {
                policy.delta_sync = delta;
            }
        }
        if self.policy.read().await.auto_sync {
            self.clone().start_auto_sync().await;
        } else {
            self.stop_auto_sync().await;
        }
    }

    /// Start (or re-arm) the recurring pending-session flush.
    pub async fn start_auto_sync(self: Arc<Self>) {
        let interval = self.policy.read().await.sync_interval;
        let this = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so the timer waits
            // a full interval before the first flush.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if this.is_offline() {
                    continue;
                }
                let results = this.flush_pending().await;
                if !results.is_empty() {
                    debug!(count = results.len(), "auto-sync flushed pending sessions");
                }
            }
        });
        if let Some(old) = self.auto_task.lock().await.replace(handle) {
            old.abort();
        }
    }

    /// Stop the auto-sync timer.
    pub async fn stop_auto_sync(&self) {
        if let Some(handle) = self.auto_task.lock().await.take() {
            handle.abort();
        }
    }

    // ---- listeners --------------------------------------------------------

    /// Subscribe to per-stage sync progress events.
    pub fn subscribe_progress(
        &self,
        listener: impl Fn(&SyncProgress) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.progress_listeners.subscribe(Box::new(listener))
    }

    /// Remove a progress subscription.
    pub fn unsubscribe_progress(&self, id: SubscriptionId) -> bool {
        self.progress_listeners.unsubscribe(id)
    }

    /// Subscribe to conflicts left open by the `prompt` strategy.
    pub fn subscribe_conflicts(
        &self,
        listener: impl Fn(&SyncConflict) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.conflict_listeners.subscribe(Box::new(listener))
    }

    /// Remove a conflict subscription.
    pub fn unsubscribe_conflicts(&self, id: SubscriptionId) -> bool {
        self.conflict_listeners.unsubscribe(id)
    }

    /// Subscribe to structured sync errors.
    pub fn subscribe_errors(
        &self,
        listener: impl Fn(&SyncErrorEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.error_listeners.subscribe(Box::new(listener))
    }

    /// Remove an error subscription.
    pub fn unsubscribe_errors(&self, id: SubscriptionId) -> bool {
        self.error_listeners.unsubscribe(id)
    }

    fn emit_progress(&self, session_id: &str, stage: &'static str, percent: u8) {
        self.progress_listeners.notify(&SyncProgress {
            session_id: session_id.to_string(),
            stage,
            percent,
        });
    }

    // ---- single-session sync ---------------------------------------------

    /// Reconcile one session. A session already syncing returns an
    /// immediate failure rather than double-running; all other failures
    /// come back as structured results, never as panics or errors.
    pub async fn sync_session(&self, session_id: &str) -> SyncResult {
        {
            let mut in_flight = self.in_flight.write().await;
            if !in_flight.insert(session_id.to_string()) {
                return SyncResult::failed(session_id, "sync already in progress", false);
            }
        }
        let started = Instant::now();
        let outcome = self.run_sync(session_id).await;
        // Cleared on every path, success or failure.
        self.in_flight.write().await.remove(session_id);

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                self.set_status(session_id, SyncStatus::Error).await;
                let event = SyncErrorEvent {
                    session_id: session_id.to_string(),
                    code: SYNC_FAILED,
                    message: e.to_string(),
                    retryable: true,
                };
                self.error_listeners.notify(&event);
                self.telemetry.record_error(&e);
                if e.is_critical() {
                    let recovered = self
                        .telemetry
                        .handle_alert(Alert {
                            severity: e.severity(),
                            message: e.to_string(),
                        })
                        .await;
                    if !recovered {
                        warn!(session_id, error = %e, "sink did not recover from alert");
                    }
                }
                SyncResult::failed(session_id, e.to_string(), true)
            }
        };
        self.telemetry.record_sync(SyncEvent {
            session_id: session_id.to_string(),
            success: result.success,
            duration: started.elapsed(),
        });
        result
    }

    async fn run_sync(&self, session_id: &str) -> Result<SyncResult> {
        if self.is_offline() {
            return Ok(SyncResult::failed(session_id, "offline mode active", true));
        }
        if !self.remote.is_available() {
            return Ok(SyncResult::failed(session_id, "remote unavailable", true));
        }

        self.emit_progress(session_id, "fetch-local", 10);
        let local = self.fetch_local(session_id).await?;

        self.emit_progress(session_id, "fetch-remote", 30);
        let retry = {
            let policy = self.policy.read().await;
            RetryConfig::with_max_retries(policy.max_retries)
        };
        let remote = retry
            .retry(|| self.fetch_remote(session_id))
            .await?;

        self.emit_progress(session_id, "detect-conflicts", 50);
        let mut conflicts =
            detect_conflicts_between(session_id, local.as_ref(), remote.as_ref());

        if !conflicts.is_empty() {
            self.emit_progress(session_id, "resolve-conflicts", 70);
            let mut unresolved = false;
            for conflict in conflicts.iter_mut() {
                self.handle_conflict(conflict).await?;
                unresolved |= !conflict.resolved;
            }
            if unresolved {
                self.set_status(session_id, SyncStatus::Conflict).await;
                let mut result =
                    SyncResult::failed(session_id, "unresolved conflict", false);
                result.conflicts = conflicts;
                return Ok(result);
            }
        }

        self.emit_progress(session_id, "apply", 90);
        // Resolution may have rewritten local state; recompute the delta
        // from what is actually stored now.
        let local = self.fetch_local(session_id).await?;
        let stats = self
            .perform_sync(session_id, local.as_ref(), remote.as_ref())
            .await?;
        debug!(session_id, ?stats, "sync delta applied");

        self.pending.write().await.remove(session_id);
        self.set_status(session_id, SyncStatus::Synced).await;
        self.emit_progress(session_id, "done", 100);

        let mut result = SyncResult::ok(session_id);
        result.conflicts = conflicts;
        Ok(result)
    }

    async fn fetch_local(&self, session_id: &str) -> Result<Option<Session>> {
        let key = StoreKey::session(session_id).encode();
        let value = match self.durable.get(&key).await? {
            Some(value) => Some(value),
            None => self.volatile.get(&key).await?,
        };
        value
            .map(|v| serde_json::from_value(v).map_err(StorageError::from))
            .transpose()
    }

    async fn fetch_remote(&self, session_id: &str) -> Result<Option<Session>> {
        let key = StoreKey::session(session_id).encode();
        self.remote
            .get(&key)
            .await?
            .map(|v| serde_json::from_value(v).map_err(StorageError::from))
            .transpose()
    }

    async fn write_local(&self, session: &Session) -> Result<()> {
        let key = StoreKey::session(&session.id).encode();
        let value = serde_json::to_value(session)?;
        let (v, d) = tokio::join!(
            self.volatile.set(&key, value.clone(), None),
            self.durable.set(&key, value, None),
        );
        if let Err(e) = v {
            warn!(session_id = %session.id, error = %e, "volatile write failed during sync");
        }
        d
    }

    async fn delete_local(&self, session_id: &str) -> Result<()> {
        let key = StoreKey::session(session_id).encode();
        let (v, d) = tokio::join!(self.volatile.delete(&key), self.durable.delete(&key));
        if let Err(e) = v {
            warn!(session_id, error = %e, "volatile delete failed during sync");
        }
        d.map(|_| ())
    }

    // ---- conflicts --------------------------------------------------------

    /// Detect divergence between the local and remote records for one
    /// session by comparing presence and version numbers.
    ///
    /// Equal versions never conflict, even when both sides carry divergent
    /// content; a pure version counter cannot tell concurrent equal-version
    /// edits apart, and this engine deliberately keeps that policy.
    pub async fn detect_conflicts(&self, session_id: &str) -> Result<Vec<SyncConflict>> {
        let local = self.fetch_local(session_id).await?;
        let remote = self.fetch_remote(session_id).await?;
        Ok(detect_conflicts_between(
            session_id,
            local.as_ref(),
            remote.as_ref(),
        ))
    }

    /// Apply the policy's default strategy to a detected conflict.
    /// `prompt` notifies conflict listeners and leaves the conflict open.
    pub async fn handle_conflict(&self, conflict: &mut SyncConflict) -> Result<()> {
        let strategy = self.policy.read().await.conflict_resolution;
        match strategy {
            ConflictStrategy::LocalWins => {
                self.resolve_conflict(conflict, ConflictResolution::LocalWins)
                    .await?;
                conflict.resolved = true;
            }
            ConflictStrategy::RemoteWins => {
                self.resolve_conflict(conflict, ConflictResolution::RemoteWins)
                    .await?;
                conflict.resolved = true;
            }
            ConflictStrategy::Prompt => {
                self.open_conflicts
                    .write()
                    .await
                    .insert(conflict.session_id.clone(), conflict.clone());
                self.conflict_listeners.notify(conflict);
            }
        }
        Ok(())
    }

    /// Apply an explicit resolution to a conflict.
    pub async fn resolve_conflict(
        &self,
        conflict: &SyncConflict,
        resolution: ConflictResolution,
    ) -> Result<()> {
        match resolution {
            ConflictResolution::LocalWins => {
                // Local data stands; nothing to write.
            }
            ConflictResolution::RemoteWins => match &conflict.remote_data {
                Some(remote) => self.write_local(remote).await?,
                None => self.delete_local(&conflict.session_id).await?,
            },
            ConflictResolution::Merge(merged) => {
                self.write_local(&merged).await?;
            }
            ConflictResolution::Manual => {
                // An external resolver must act; leave everything as is.
                return Ok(());
            }
        }
        self.open_conflicts
            .write()
            .await
            .remove(&conflict.session_id);
        Ok(())
    }

    /// Conflicts left open by the `prompt`/manual paths.
    pub async fn open_conflicts(&self) -> Vec<SyncConflict> {
        self.open_conflicts.read().await.values().cloned().collect()
    }

    // ---- delta ------------------------------------------------------------

    /// Apply the local/remote delta: create locally, delete locally, or
    /// merge a newer remote record into the local one. A remote version at
    /// or below the local version is a no-op.
    pub async fn perform_sync(
        &self,
        session_id: &str,
        local: Option<&Session>,
        remote: Option<&Session>,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();
        match (local, remote) {
            (None, Some(remote)) => {
                self.write_local(remote).await?;
                stats.created += 1;
            }
            (Some(_), None) => {
                self.delete_local(session_id).await?;
                stats.deleted += 1;
            }
            (Some(local), Some(remote)) if remote.version > local.version => {
                let mut merged = remote.clone();
                merged.last_sync_at = Some(now_millis());
                merged.remote_id = remote
                    .remote_id
                    .clone()
                    .or_else(|| local.remote_id.clone());
                self.write_local(&merged).await?;
                stats.updated += 1;
            }
            _ => {}
        }
        Ok(stats)
    }

    // ---- batches ----------------------------------------------------------

    /// Reconcile every session of one agent: the union of local and remote
    /// ids, in fixed-size batches with intra-batch parallelism.
    pub async fn sync_agent_sessions(&self, agent_id: &str) -> BatchSyncResult {
        let mut ids = self.local_session_ids(agent_id).await;
        let mut seen: HashSet<String> = ids.iter().cloned().collect();
        for id in self.remote_session_ids(agent_id).await {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }

        let batch_size = self.policy.read().await.batch_size.max(1);
        let mut result = BatchSyncResult {
            agent_id: agent_id.to_string(),
            total_sessions: ids.len(),
            ..Default::default()
        };

        let total_batches = ids.len().div_ceil(batch_size).max(1);
        for (index, chunk) in ids.chunks(batch_size).enumerate() {
            let outcomes = join_all(chunk.iter().map(|id| self.sync_session(id))).await;
            for outcome in outcomes {
                if outcome.success {
                    result.success_count += 1;
                } else {
                    result.failure_count += 1;
                }
                if !outcome.conflicts.is_empty() {
                    result.conflict_count += 1;
                }
            }
            let percent = (((index + 1) * 100) / total_batches).min(100) as u8;
            self.emit_progress(agent_id, "batch", percent);
        }
        result
    }

    /// Reconcile every known agent and merge the batch results.
    pub async fn sync_all_sessions(&self) -> BatchSyncResult {
        let mut merged = BatchSyncResult {
            agent_id: "*".to_string(),
            ..Default::default()
        };
        for agent_id in self.known_agents().await {
            let batch = self.sync_agent_sessions(&agent_id).await;
            merged.absorb(&batch);
        }
        merged
    }

    async fn local_session_ids(&self, agent_id: &str) -> Vec<String> {
        let keys = match self.durable.list(Some(SESSION_PREFIX), None).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "local session listing failed");
                return Vec::new();
            }
        };
        let mut ids = Vec::new();
        for key in keys {
            let Some(StoreKey::Session(id)) = StoreKey::parse(&key) else {
                continue;
            };
            match self.durable.get(&key).await {
                Ok(Some(value)) => {
                    if value.get("agentId").and_then(Value::as_str) == Some(agent_id) {
                        ids.push(id);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(key, error = %e, "unreadable local session"),
            }
        }
        ids
    }

    async fn remote_session_ids(&self, agent_id: &str) -> Vec<String> {
        if !self.remote.is_available() {
            return Vec::new();
        }
        let query = SearchQuery::for_agent(agent_id);
        match self.remote.search(&query).await {
            Ok(hits) => hits
                .into_iter()
                .filter_map(|hit| match StoreKey::parse(&hit.key) {
                    Some(StoreKey::Session(id)) => Some(id),
                    _ => None,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "remote session listing failed");
                Vec::new()
            }
        }
    }

    async fn known_agents(&self) -> Vec<String> {
        let keys = self
            .durable
            .list(Some(SESSION_PREFIX), None)
            .await
            .unwrap_or_default();
        let mut agents = HashSet::new();
        for key in keys {
            if let Ok(Some(value)) = self.durable.get(&key).await {
                if let Some(agent) = value.get("agentId").and_then(Value::as_str) {
                    agents.insert(agent.to_string());
                }
            }
        }
        let mut agents: Vec<String> = agents.into_iter().collect();
        agents.sort();
        agents
    }

    // ---- incremental updates ---------------------------------------------

    /// Pull remote changes newer than the watermark, normalized with a
    /// checksum over each serialized payload. Providers without an
    /// incremental feed yield an empty list.
    pub async fn incremental_updates(
        &self,
        agent_id: &str,
        since: Option<i64>,
    ) -> Result<Vec<IncrementalUpdate>> {
        match self.remote.changes_since(agent_id, since).await? {
            Some(mut updates) => {
                for update in updates.iter_mut() {
                    update.checksum = update
                        .data
                        .as_ref()
                        .map(payload_checksum)
                        .unwrap_or_default();
                }
                Ok(updates)
            }
            None => {
                debug!(agent_id, "remote provider has no incremental feed");
                Ok(Vec::new())
            }
        }
    }

    /// Apply incremental updates to both local tiers, continuing past
    /// per-item failures. Returns how many updates applied cleanly.
    pub async fn apply_incremental_updates(&self, updates: &[IncrementalUpdate]) -> usize {
        let mut applied = 0;
        for update in updates {
            let key = StoreKey::session(&update.session_id).encode();
            let ok = match update.kind {
                UpdateKind::Create | UpdateKind::Update => match &update.data {
                    Some(data) => {
                        let (v, d) = tokio::join!(
                            self.volatile.set(&key, data.clone(), None),
                            self.durable.set(&key, data.clone(), None),
                        );
                        if let Err(e) = v {
                            warn!(session_id = %update.session_id, error = %e, "volatile update failed");
                        }
                        match d {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(session_id = %update.session_id, error = %e, "durable update failed");
                                false
                            }
                        }
                    }
                    None => {
                        warn!(session_id = %update.session_id, "update carries no payload, skipping");
                        false
                    }
                },
                UpdateKind::Delete => {
                    let (v, d) = tokio::join!(self.volatile.delete(&key), self.durable.delete(&key));
                    if let Err(e) = v {
                        warn!(session_id = %update.session_id, error = %e, "volatile delete failed");
                    }
                    match d {
                        Ok(_) => true,
                        Err(e) => {
                            warn!(session_id = %update.session_id, error = %e, "durable delete failed");
                            false
                        }
                    }
                }
            };
            if ok {
                applied += 1;
            }
        }
        applied
    }
}

/// Pure conflict detection over presence and version numbers.
fn detect_conflicts_between(
    session_id: &str,
    local: Option<&Session>,
    remote: Option<&Session>,
) -> Vec<SyncConflict> {
    let conflict = match (local, remote) {
        (None, Some(remote)) => Some(SyncConflict {
            session_id: session_id.to_string(),
            local_version: 0,
            remote_version: remote.version,
            local_data: None,
            remote_data: Some(remote.clone()),
            conflict_type: ConflictType::Merge,
            resolved: false,
        }),
        (Some(local), None) => Some(SyncConflict {
            session_id: session_id.to_string(),
            local_version: local.version,
            remote_version: 0,
            local_data: Some(local.clone()),
            remote_data: None,
            conflict_type: ConflictType::Delete,
            resolved: false,
        }),
        (Some(local), Some(remote)) if local.version != remote.version => Some(SyncConflict {
            session_id: session_id.to_string(),
            local_version: local.version,
            remote_version: remote.version,
            local_data: Some(local.clone()),
            remote_data: Some(remote.clone()),
            conflict_type: ConflictType::Update,
            resolved: false,
        }),
        _ => None,
    };
    conflict.into_iter().collect()
}

/// Hex SHA-256 over the serialized payload.
pub(crate) fn payload_checksum(value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, version: u64) -> Session {
        let mut s = Session::new(id, "a1", "t");
        s.version = version;
        s
    }

    #[test]
    fn test_detect_no_conflict_on_equal_versions() {
        for version in [0u64, 1, 7, 100] {
            let local = session("s1", version);
            let remote = session("s1", version);
            assert!(
                detect_conflicts_between("s1", Some(&local), Some(&remote)).is_empty(),
                "version {version} must not conflict"
            );
        }
        assert!(detect_conflicts_between("s1", None, None).is_empty());
    }

    #[test]
    fn test_detect_update_conflict() {
        let local = session("s1", 3);
        let remote = session("s1", 5);
        let conflicts = detect_conflicts_between("s1", Some(&local), Some(&remote));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Update);
        assert_eq!(conflicts[0].local_version, 3);
        assert_eq!(conflicts[0].remote_version, 5);
    }

    #[test]
    fn test_detect_delete_conflict() {
        let local = session("s2", 3);
        let conflicts = detect_conflicts_between("s2", Some(&local), None);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Delete);
        assert_eq!(conflicts[0].local_version, 3);
        assert_eq!(conflicts[0].remote_version, 0);
    }

    #[test]
    fn test_detect_merge_conflict() {
        let remote = session("s3", 2);
        let conflicts = detect_conflicts_between("s3", None, Some(&remote));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::Merge);
        assert_eq!(conflicts[0].local_version, 0);
    }

    #[test]
    fn test_checksum_is_stable_and_sensitive() {
        let a = serde_json::json!({"id": "s1", "version": 1});
        let b = serde_json::json!({"id": "s1", "version": 2});
        assert_eq!(payload_checksum(&a), payload_checksum(&a));
        assert_ne!(payload_checksum(&a), payload_checksum(&b));
        assert_eq!(payload_checksum(&a).len(), 64);
    }

    #[test]
    fn test_listener_registry_unsubscribe() {
        let registry: ListenerRegistry<u32> = ListenerRegistry::new();
        let hits = std::sync::Arc::new(AtomicU64::new(0));
        let hits_clone = hits.clone();
        let id = registry.subscribe(Box::new(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.notify(&1);
        assert!(registry.unsubscribe(id));
        registry.notify(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!registry.unsubscribe(id));
    }
}
