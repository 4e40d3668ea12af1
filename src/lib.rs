//! # tierstore
//!
//! A hybrid three-tier storage engine for chat clients: a fast volatile
//! cache, a durable local store, and a remote system of record, kept
//! consistent by temperature-based cache management and version-based
//! synchronization.
//!
//! ## Features
//!
//! - **Three tiers, one contract**: every tier implements the same async
//!   [`StorageProvider`] trait
//! - **Temperature-aware caching**: HOT/WARM/COLD placement with promotion,
//!   demotion, and background preloading
//! - **Conflict-aware sync**: version-based conflict detection with
//!   pluggable resolution strategies and offline mode
//! - **No globals**: telemetry and connectivity are injected collaborators
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tierstore::{Session, StorageConfig, StorageManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = StorageConfig::builder()
//!         .data_dir("./sessions")
//!         .auto_sync(true)
//!         .build();
//!
//!     let manager = StorageManager::new(config)?;
//!     manager.init().await?;
//!
//!     let session = Session::new("s-1", "agent-1", "First chat");
//!     manager.save_session(session).await?;
//!
//!     let restored = manager.get_session("s-1").await?;
//!     println!("{:?}", restored.map(|s| s.title));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

mod cache;
mod config;
mod connectivity;
mod errors;
mod keys;
mod manager;
mod sync;
mod telemetry;
mod types;

/// Storage provider contract and the tier implementations
pub mod provider;

pub use cache::{CacheManager, CacheMetrics};
pub use config::{
    CacheConfig, ENV_REMOTE_API_KEY, ENV_REMOTE_URL, EvictionStrategy, PerformanceConfig,
    RemoteConfig, StorageConfig, StorageConfigBuilder, StorageOptions, TierConfig,
};
pub use connectivity::ConnectivityObserver;
pub use errors::{ErrorSeverity, Result, StorageError};
pub use keys::{PROBE_PREFIX, SESSION_PREFIX, SYNC_PREFIX, StoreKey};
pub use manager::{HealthReport, StorageManager};
pub use provider::{
    ProviderStats, SearchHit, SearchQuery, SetOptions, StorageProvider,
};
pub use sync::{SubscriptionId, SyncManager, SyncStats, SYNC_FAILED};
pub use telemetry::{
    AccessEvent, AccessTier, Alert, MemoryTelemetry, NoopTelemetry, RetryConfig, SyncEvent,
    TelemetrySink,
};
pub use types::{
    BatchSyncResult, CacheEntry, CacheTier, ConflictResolution, ConflictStrategy, ConflictType,
    IncrementalUpdate, Message, MessageRole, PreloadTask, Session, SessionSummary, SyncConflict,
    SyncErrorEvent, SyncPolicy, SyncPolicyUpdate, SyncProgress, SyncResult, SyncStatus,
    Temperature, UpdateKind, now_millis,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        ConflictStrategy, Message, MessageRole, Result, Session, StorageConfig, StorageError,
        StorageManager, StorageProvider, SyncPolicy, SyncStatus, Temperature,
    };
}
