//! Core types for watcher lifecycle management.

use serde::{Deserialize, Serialize};

/// Unique identifier for a watcher instance.
///
/// UUIDs rather than list indices: a watcher can be removed from the
/// registry by a thread-mode stop and registered again later, and its
/// identity must survive that round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatcherId(uuid::Uuid);

impl WatcherId {
    /// Creates a new random watcher ID.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a watcher ID from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for WatcherId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WatcherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution substrate a watcher runs on.
///
/// Chosen once, before the watcher is actually spawned; a running watcher
/// never changes substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// A thread inside the host's own process.
    Thread,
    /// A thread inside the single shared forked worker process.
    Subprocess,
}

/// Watcher lifecycle state.
///
/// ```text
/// Registered → Starting → Running → Stopping → Done
/// ```
///
/// Derived from the watcher's signals rather than stored: the signals are
/// the cross-process source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatcherState {
    /// Created and registered; not yet started.
    Registered,
    /// `start()` called; execution unit not yet spawned.
    Starting,
    /// Poll loop is executing ticks.
    Running,
    /// Stop requested; loop has not yet observed it.
    Stopping,
    /// Loop and post-run hook have completed. Terminal.
    Done,
}

impl WatcherState {
    /// Returns true if the watcher has reached its terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Returns true if the watcher's loop is (or should be) executing.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watcher_id_unique() {
        assert_ne!(WatcherId::new(), WatcherId::new());
    }

    #[test]
    fn test_watcher_id_display_roundtrip() {
        let id = WatcherId::new();
        let parsed = uuid::Uuid::parse_str(&id.to_string()).unwrap();
        assert_eq!(WatcherId::from_uuid(parsed), id);
    }

    #[test]
    fn test_state_predicates() {
        assert!(WatcherState::Done.is_terminal());
        assert!(!WatcherState::Running.is_terminal());
        assert!(WatcherState::Running.is_active());
        assert!(WatcherState::Stopping.is_active());
        assert!(!WatcherState::Registered.is_active());
        assert!(!WatcherState::Starting.is_active());
    }
}
