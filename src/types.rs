//! Core data model for the tierstore engine
//!
//! Sessions are the unit of storage: one conversation thread per session,
//! owned by the [`StorageManager`](crate::StorageManager) and mutated only
//! through its operations. Everything else here is bookkeeping around them:
//! cache entries, sync state, conflicts, and the policy knobs that drive
//! reconciliation.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End-user message
    User,
    /// Agent/assistant message
    Assistant,
    /// System or tooling message
    System,
}

/// A single message inside a conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message id
    pub id: String,
    /// Author role
    pub role: MessageRole,
    /// Message body
    pub content: String,
    /// Epoch milliseconds when the message was produced
    pub timestamp: i64,
}

/// A conversation thread.
///
/// `version` increases monotonically on every reconciled change and is the
/// sole input to conflict detection. `remote_id` links the session to its
/// authoritative remote record; a session without one is explicitly
/// local-only until a sync assigns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id
    pub id: String,
    /// Owning logical agent/bot
    pub agent_id: String,
    /// Ordered message list
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Human-readable title
    pub title: String,
    /// Epoch millis of creation
    pub created_at: i64,
    /// Epoch millis of last modification
    pub updated_at: i64,
    /// Epoch millis of last read access
    pub last_accessed_at: i64,
    /// Message count, kept in step with `messages`
    pub message_count: usize,
    /// Monotonically increasing version used for conflict detection
    pub version: u64,
    /// Authoritative remote record id, if the session has ever synced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    /// Epoch millis of the last successful sync, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
}

impl Session {
    /// Create an empty session for an agent.
    pub fn new(id: impl Into<String>, agent_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            messages: Vec::new(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            last_accessed_at: now,
            message_count: 0,
            version: 1,
            remote_id: None,
            last_sync_at: None,
        }
    }

    /// Append a message, keeping `message_count` and `updated_at` in step.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.message_count = self.messages.len();
        self.updated_at = now_millis();
    }

    /// Produce a listing summary for this session.
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            title: self.title.clone(),
            updated_at: self.updated_at,
            message_count: self.message_count,
            remote_id: self.remote_id.clone(),
        }
    }
}

/// Lightweight session record used for agent listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    /// Session id
    pub id: String,
    /// Owning agent
    pub agent_id: String,
    /// Title
    pub title: String,
    /// Epoch millis of last modification
    pub updated_at: i64,
    /// Message count
    pub message_count: usize,
    /// Remote record id, if any
    pub remote_id: Option<String>,
}

/// HOT/WARM/COLD classification driving which tier(s) hold a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Temperature {
    /// Held in the volatile tier (and usually the durable tier too)
    Hot,
    /// Held in the durable tier, volatile only when capacity allows
    Warm,
    /// Durable tier only
    Cold,
}

/// Which tier(s) currently hold a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Volatile tier only
    Volatile,
    /// Durable tier only
    Durable,
    /// Both local tiers
    Both,
}

/// Per-key bookkeeping the cache manager maintains for every value it has
/// seen: access statistics, the derived temperature, and tier membership.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Key the entry lives under
    pub key: String,
    /// Epoch millis when first written
    pub timestamp: i64,
    /// Epoch millis of the most recent access
    pub last_accessed: i64,
    /// Number of reads since the entry was created
    pub access_count: u64,
    /// Current temperature classification
    pub temperature: Temperature,
    /// Optional expiry (epoch millis)
    pub expires_at: Option<i64>,
    /// Serialized size in bytes, used for capacity accounting
    pub size: usize,
    /// Which tier(s) hold the value
    pub tier: CacheTier,
}

impl CacheEntry {
    /// New entry for a value just written.
    pub fn new(key: impl Into<String>, temperature: Temperature, size: usize, tier: CacheTier) -> Self {
        let now = now_millis();
        Self {
            key: key.into(),
            timestamp: now,
            last_accessed: now,
            access_count: 0,
            temperature,
            expires_at: None,
            size,
            tier,
        }
    }

    /// Record a read access.
    pub fn touch(&mut self) {
        self.last_accessed = now_millis();
        self.access_count += 1;
    }
}

/// Per-session synchronization status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncStatus {
    /// Local and remote agree as of the last reconciliation
    Synced,
    /// Local changes not yet confirmed synced to the remote tier
    Pending,
    /// An unresolved conflict blocks reconciliation
    Conflict,
    /// Offline mode is active; reconciliation is deferred
    Offline,
    /// The last reconciliation attempt failed
    Error,
}

/// Kind of divergence between a local and remote session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// Both sides present with differing versions
    Update,
    /// Local present, remote absent
    Delete,
    /// Remote present, local absent
    Merge,
}

/// A detected divergence between local and remote state for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConflict {
    /// Session the conflict belongs to
    pub session_id: String,
    /// Local version (0 when no local record exists)
    pub local_version: u64,
    /// Remote version (0 when no remote record exists)
    pub remote_version: u64,
    /// Local record, if present
    pub local_data: Option<Session>,
    /// Remote record, if present
    pub remote_data: Option<Session>,
    /// Kind of divergence
    pub conflict_type: ConflictType,
    /// Set once a resolution has been applied
    pub resolved: bool,
}

/// Default strategy applied when a conflict is detected during sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Keep the local record untouched
    LocalWins,
    /// Overwrite local tiers with the remote record
    RemoteWins,
    /// Notify conflict listeners and leave the conflict open
    Prompt,
}

/// Per-conflict resolution command passed to
/// [`SyncManager::resolve_conflict`](crate::SyncManager::resolve_conflict).
#[derive(Debug, Clone)]
pub enum ConflictResolution {
    /// Local data stands; no write performed
    LocalWins,
    /// Overwrite both local tiers with the remote record
    RemoteWins,
    /// Write a caller-supplied pre-merged session
    Merge(Session),
    /// No automatic action; an external resolver must act
    Manual,
}

/// Reconciliation policy. Configuration, never persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPolicy {
    /// Flush pending sessions on a recurring timer
    pub auto_sync: bool,
    /// Interval between auto-sync flushes
    pub sync_interval: Duration,
    /// Sessions reconciled per batch during agent-scoped sync
    pub batch_size: usize,
    /// Bounded retry attempts for transient remote failures
    pub max_retries: u32,
    /// Default strategy applied to detected conflicts
    pub conflict_resolution: ConflictStrategy,
    /// Hint: compress payloads on the wire
    pub compress_data: bool,
    /// Hint: send deltas instead of full records
    pub delta_sync: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            auto_sync: false,
            sync_interval: Duration::from_secs(60),
            batch_size: 10,
            max_retries: 3,
            conflict_resolution: ConflictStrategy::RemoteWins,
            compress_data: false,
            delta_sync: true,
        }
    }
}

/// Partial policy update; `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct SyncPolicyUpdate {
    /// New auto-sync flag
    pub auto_sync: Option<bool>,
    /// New sync interval
    pub sync_interval: Option<Duration>,
    /// New batch size
    pub batch_size: Option<usize>,
    /// New retry bound
    pub max_retries: Option<u32>,
    /// New default conflict strategy
    pub conflict_resolution: Option<ConflictStrategy>,
    /// New compression hint
    pub compress_data: Option<bool>,
    /// New delta-sync hint
    pub delta_sync: Option<bool>,
}

/// Outcome of reconciling a single session.
#[derive(Debug, Clone)]
pub struct SyncResult {
    /// Whether reconciliation completed
    pub success: bool,
    /// Session id
    pub session_id: String,
    /// Failure description when `success` is false
    pub error: Option<String>,
    /// Whether a retry can reasonably succeed
    pub retryable: bool,
    /// Conflicts detected during this run (resolved or open)
    pub conflicts: Vec<SyncConflict>,
}

impl SyncResult {
    /// Successful result for a session.
    pub fn ok(session_id: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: session_id.into(),
            error: None,
            retryable: false,
            conflicts: Vec::new(),
        }
    }

    /// Failed result for a session.
    pub fn failed(session_id: impl Into<String>, error: impl Into<String>, retryable: bool) -> Self {
        Self {
            success: false,
            session_id: session_id.into(),
            error: Some(error.into()),
            retryable,
            conflicts: Vec::new(),
        }
    }
}

/// Aggregated outcome of an agent-scoped batch sync.
#[derive(Debug, Clone, Default)]
pub struct BatchSyncResult {
    /// Agent whose sessions were reconciled
    pub agent_id: String,
    /// Total sessions considered (union of local and remote ids)
    pub total_sessions: usize,
    /// Sessions reconciled successfully
    pub success_count: usize,
    /// Sessions that failed reconciliation
    pub failure_count: usize,
    /// Sessions that surfaced conflicts
    pub conflict_count: usize,
}

impl BatchSyncResult {
    /// Merge another batch result into this one (used by sync-all).
    pub fn absorb(&mut self, other: &BatchSyncResult) {
        self.total_sessions += other.total_sessions;
        self.success_count += other.success_count;
        self.failure_count += other.failure_count;
        self.conflict_count += other.conflict_count;
    }
}

/// Progress event emitted at each stage of a session sync.
#[derive(Debug, Clone)]
pub struct SyncProgress {
    /// Session being reconciled
    pub session_id: String,
    /// Stage name (fetch-local, fetch-remote, detect-conflicts, ...)
    pub stage: &'static str,
    /// 0-100 completion percentage
    pub percent: u8,
}

/// Structured sync error delivered to error listeners.
#[derive(Debug, Clone)]
pub struct SyncErrorEvent {
    /// Session the failure belongs to
    pub session_id: String,
    /// Stable error code
    pub code: &'static str,
    /// Failure description
    pub message: String,
    /// Whether a retry can reasonably succeed
    pub retryable: bool,
}

/// Kind of change carried by an incremental update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    /// Record created remotely
    Create,
    /// Record updated remotely
    Update,
    /// Record deleted remotely
    Delete,
}

/// A normalized remote change newer than the requested watermark.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalUpdate {
    /// Session the change applies to
    pub session_id: String,
    /// Change kind
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// New record content (absent for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Remote version after the change
    pub version: u64,
    /// Epoch millis of the change
    pub timestamp: i64,
    /// Hex SHA-256 over the serialized payload
    #[serde(default)]
    pub checksum: String,
}

/// A queued preload request.
#[derive(Debug, Clone)]
pub struct PreloadTask {
    /// Key to warm into the volatile tier
    pub key: String,
    /// Higher sorts earlier
    pub priority: i64,
    /// Keys that should be warmed before this one
    pub dependencies: Vec<String>,
}
