//! Typed key schema for the flat provider key space
//!
//! Providers speak plain string keys; everything above them constructs those
//! strings through [`StoreKey`] so the `session:`/`sync:` prefixes exist in
//! exactly one place.

/// A typed key in the provider key space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// A conversation session record
    Session(String),
    /// Persisted sync status for a session
    SyncState(String),
    /// Throwaway health-check probe
    Probe(String),
}

/// Prefix for session records.
pub const SESSION_PREFIX: &str = "session:";
/// Prefix for persisted sync state.
pub const SYNC_PREFIX: &str = "sync:";
/// Prefix for health-check probes.
pub const PROBE_PREFIX: &str = "probe:";

impl StoreKey {
    /// Key for a session record.
    pub fn session(id: impl Into<String>) -> Self {
        Self::Session(id.into())
    }

    /// Key for a session's persisted sync status.
    pub fn sync_state(id: impl Into<String>) -> Self {
        Self::SyncState(id.into())
    }

    /// Render the key as the provider-level string.
    pub fn encode(&self) -> String {
        match self {
            Self::Session(id) => format!("{SESSION_PREFIX}{id}"),
            Self::SyncState(id) => format!("{SYNC_PREFIX}{id}"),
            Self::Probe(token) => format!("{PROBE_PREFIX}{token}"),
        }
    }

    /// Parse a provider-level string back into a typed key.
    pub fn parse(raw: &str) -> Option<Self> {
        if let Some(id) = raw.strip_prefix(SESSION_PREFIX) {
            (!id.is_empty()).then(|| Self::Session(id.to_string()))
        } else if let Some(id) = raw.strip_prefix(SYNC_PREFIX) {
            (!id.is_empty()).then(|| Self::SyncState(id.to_string()))
        } else if let Some(token) = raw.strip_prefix(PROBE_PREFIX) {
            (!token.is_empty()).then(|| Self::Probe(token.to_string()))
        } else {
            None
        }
    }

    /// The session id, for session and sync-state keys.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Session(id) | Self::SyncState(id) => Some(id),
            Self::Probe(_) => None,
        }
    }
}

impl std::fmt::Display for StoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let keys = [
            StoreKey::session("s1"),
            StoreKey::sync_state("s1"),
            StoreKey::Probe("abc".into()),
        ];
        for key in keys {
            assert_eq!(StoreKey::parse(&key.encode()), Some(key));
        }
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert_eq!(StoreKey::parse("unknown:x"), None);
        assert_eq!(StoreKey::parse("session:"), None);
        assert_eq!(StoreKey::parse(""), None);
    }

    #[test]
    fn test_session_id_accessor() {
        assert_eq!(StoreKey::session("s1").session_id(), Some("s1"));
        assert_eq!(StoreKey::sync_state("s2").session_id(), Some("s2"));
        assert_eq!(StoreKey::Probe("t".into()).session_id(), None);
    }
}
