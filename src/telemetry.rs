//! Telemetry collaborator interface and retry utilities
//!
//! The engine never aggregates its own metrics beyond the cache counters;
//! it emits events into a [`TelemetrySink`] injected at construction.
//! Critical-severity errors are escalated by the engine through
//! [`TelemetrySink::handle_alert`] as they are recorded, and the engine
//! awaits the sink's recovery outcome.

use crate::errors::{ErrorSeverity, Result, StorageError};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Which tier an access event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTier {
    /// Volatile tier
    Volatile,
    /// Durable tier
    Durable,
    /// Remote tier
    Remote,
}

/// A storage access observed by the engine.
#[derive(Debug, Clone)]
pub struct AccessEvent {
    /// Tier that served (or missed) the access
    pub tier: AccessTier,
    /// Wall time the access took
    pub duration: Duration,
    /// Whether the access found a value
    pub hit: bool,
    /// Serialized size of the value, when known
    pub size: Option<usize>,
}

/// A completed (or failed) sync observed by the engine.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    /// Session reconciled
    pub session_id: String,
    /// Whether reconciliation completed
    pub success: bool,
    /// Wall time the reconciliation took
    pub duration: Duration,
}

/// A structured alert escalated to the collaborator.
#[derive(Debug, Clone)]
pub struct Alert {
    /// Severity of the underlying condition
    pub severity: ErrorSeverity,
    /// Human-readable description
    pub message: String,
}

/// Collaborator receiving telemetry from the engine.
///
/// Implementations own aggregation, reporting, and recovery strategy;
/// the engine only records and, for alerts, awaits the recovery outcome.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Record a storage access.
    fn record_access(&self, event: AccessEvent);

    /// Record a sync outcome.
    fn record_sync(&self, event: SyncEvent);

    /// Record evictions on a tier.
    fn record_eviction(&self, tier: AccessTier, count: usize);

    /// Record an error. Critical-severity errors additionally arrive as an
    /// [`Alert`] through [`handle_alert`](Self::handle_alert).
    fn record_error(&self, error: &StorageError);

    /// Handle an alert escalated by the engine. Returns whether recovery
    /// succeeded.
    async fn handle_alert(&self, alert: Alert) -> bool;
}

/// Sink that drops everything. The default when no collaborator is wired.
#[derive(Debug, Default)]
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    fn record_access(&self, _event: AccessEvent) {}
    fn record_sync(&self, _event: SyncEvent) {}
    fn record_eviction(&self, _tier: AccessTier, _count: usize) {}
    fn record_error(&self, _error: &StorageError) {}
    async fn handle_alert(&self, _alert: Alert) -> bool {
        true
    }
}

/// Sink that captures events in memory for tests and local inspection.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    /// Captured access events
    pub accesses: Mutex<Vec<AccessEvent>>,
    /// Captured sync events
    pub syncs: Mutex<Vec<SyncEvent>>,
    /// Captured evictions as (tier, count)
    pub evictions: Mutex<Vec<(AccessTier, usize)>>,
    /// Captured error descriptions with severity
    pub errors: Mutex<Vec<(ErrorSeverity, String)>>,
    /// Alerts escalated by the engine
    pub alerts: Mutex<Vec<Alert>>,
}

impl MemoryTelemetry {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded access events.
    pub fn access_count(&self) -> usize {
        self.accesses.lock().expect("telemetry lock").len()
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetry {
    fn record_access(&self, event: AccessEvent) {
        self.accesses.lock().expect("telemetry lock").push(event);
    }

    fn record_sync(&self, event: SyncEvent) {
        self.syncs.lock().expect("telemetry lock").push(event);
    }

    fn record_eviction(&self, tier: AccessTier, count: usize) {
        self.evictions.lock().expect("telemetry lock").push((tier, count));
    }

    fn record_error(&self, error: &StorageError) {
        self.errors
            .lock()
            .expect("telemetry lock")
            .push((error.severity(), error.to_string()));
    }

    async fn handle_alert(&self, alert: Alert) -> bool {
        self.alerts.lock().expect("telemetry lock").push(alert);
        true
    }
}

/// Configuration for exponential-backoff retry of transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0) to add randomness to delays
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Bound the attempt count, keeping the other knobs at their defaults.
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Execute a fallible future with backoff. Only errors whose
    /// [`is_retryable`](StorageError::is_retryable) is true are retried;
    /// conflicts and validation failures surface immediately.
    pub async fn retry<F, Fut, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut retries = 0;
        let mut delay = self.initial_delay;

        loop {
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && retries < self.max_retries => {
                    retries += 1;

                    let jitter = if self.jitter_factor > 0.0 {
                        let range = delay.as_secs_f64() * self.jitter_factor;
                        let jitter = rand::random::<f64>() * range - (range / 2.0);
                        Duration::from_secs_f64(jitter.abs())
                    } else {
                        Duration::ZERO
                    };

                    let actual_delay = delay + jitter;
                    warn!(attempt = retries, delay = ?actual_delay, error = %e, "retrying after failure");
                    sleep(actual_delay).await;

                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * self.backoff_multiplier)
                            .min(self.max_delay.as_secs_f64()),
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}
