//! Error types for the tierstore engine
//!
//! The taxonomy mirrors the failure surfaces of the engine: provider I/O,
//! reconciliation, tiering, network reachability, input validation, and
//! unexpected internal faults. Every error carries a severity that is
//! independent of its kind, so a transient network blip can be `Low` while a
//! corrupted durable record is `Critical`.

use thiserror::Error;

/// Severity attached to every error, orthogonal to the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Degraded but self-healing (cache miss, single retry)
    Low,
    /// Needs attention eventually (repeated sync failure)
    Medium,
    /// User-visible impact likely (durable write failure)
    High,
    /// Data integrity or availability at risk
    Critical,
}

/// Main error type for tierstore operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// A storage provider failed an I/O operation
    #[error("Provider '{provider}' failed during {operation}: {message}")]
    Provider {
        /// Provider name (volatile, durable, remote)
        provider: String,
        /// Operation that failed (get, set, list, ...)
        operation: String,
        /// Failure description
        message: String,
    },

    /// Reconciliation against the remote tier failed
    #[error("Sync failed for session {session_id}: {message}")]
    Sync {
        /// Session being reconciled
        session_id: String,
        /// Failure description
        message: String,
        /// Whether a retry can reasonably succeed
        retryable: bool,
    },

    /// Tiering (promotion/demotion/eviction) failed
    #[error("Cache error: {0}")]
    Cache(String),

    /// Remote tier unreachable or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Malformed input rejected before touching any tier
    #[error("Validation error: {0}")]
    Validation(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem errors from the durable tier
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Uncaught/unexpected internal fault
    #[error("Critical error: {0}")]
    Critical(String),
}

/// Result type alias for tierstore operations
pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Create a provider error
    pub fn provider(
        provider: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a retryable sync error
    pub fn sync_retryable(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sync {
            session_id: session_id.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable sync error
    pub fn sync_fatal(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sync {
            session_id: session_id.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Severity of this error, independent of its kind
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cache(_) | Self::Network(_) => ErrorSeverity::Low,
            Self::Sync { .. } | Self::Validation(_) => ErrorSeverity::Medium,
            Self::Provider { .. } | Self::Io(_) | Self::Serialization(_) => ErrorSeverity::High,
            Self::Critical(_) => ErrorSeverity::Critical,
        }
    }

    /// Whether retrying the failed operation can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Sync { retryable, .. } => *retryable,
            Self::Provider { .. } | Self::Io(_) => true,
            _ => false,
        }
    }

    /// Whether this error must be escalated to the telemetry sink immediately
    pub fn is_critical(&self) -> bool {
        self.severity() == ErrorSeverity::Critical
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::provider("durable", "set", "disk full");
        let msg = err.to_string();
        assert!(msg.contains("durable"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_severity() {
        assert_eq!(
            StorageError::Network("timeout".into()).severity(),
            ErrorSeverity::Low
        );
        assert_eq!(
            StorageError::Critical("oops".into()).severity(),
            ErrorSeverity::Critical
        );
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
    }

    #[test]
    fn test_is_retryable() {
        assert!(StorageError::Network("timeout".into()).is_retryable());
        assert!(StorageError::sync_retryable("s1", "remote flaked").is_retryable());
        assert!(!StorageError::sync_fatal("s1", "conflict").is_retryable());
        assert!(!StorageError::Validation("bad id".into()).is_retryable());
    }

    #[test]
    fn test_critical_escalation_flag() {
        assert!(StorageError::Critical("invariant broken".into()).is_critical());
        assert!(!StorageError::Cache("tier miss".into()).is_critical());
    }
}
