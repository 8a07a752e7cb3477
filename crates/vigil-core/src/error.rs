//! Error types for vigil-core.

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Error type for watcher lifecycle and queue operations.
///
/// Deliberately-swallowed failures (queue worker writes, detach hooks,
/// debugger detection) never surface through this type; they are logged at
/// their call sites instead. Everything here is a condition the caller is
/// expected to act on.
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation invalid in the watcher's current state.
    #[error("invalid state: {0}")]
    State(String),

    /// Spawning a thread or worker process failed.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Creating or driving a signaling primitive failed.
    #[error("event error: {0}")]
    Event(String),

    /// Forking the shared worker process failed.
    #[error("fork failed: {0}")]
    Fork(String),

    /// Operation not supported on this platform.
    #[error("not supported on this platform: {0}")]
    Unsupported(String),

    /// Serializing an item for the write queue failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The queue transport was closed by its peer.
    #[error("queue transport closed")]
    Closed,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatcherError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an invalid-state error.
    #[must_use]
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Creates a spawn error.
    #[must_use]
    pub fn spawn(msg: impl Into<String>) -> Self {
        Self::Spawn(msg.into())
    }

    /// Creates an event error.
    #[must_use]
    pub fn event(msg: impl Into<String>) -> Self {
        Self::Event(msg.into())
    }

    /// Creates a fork error.
    #[must_use]
    pub fn fork(msg: impl Into<String>) -> Self {
        Self::Fork(msg.into())
    }

    /// Creates an unsupported-platform error.
    #[must_use]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Creates a serialization error.
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Wraps an OS errno.
    #[cfg(unix)]
    #[must_use]
    pub fn os(errno: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}
