//! Error types for vigil-platform.

/// Result type alias for platform operations.
pub type Result<T> = std::result::Result<T, PlatformError>;

/// Error type for process-inspection operations.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Process not found (no `/proc/{pid}` entry, or absent from the table).
    #[error("process not found: {0}")]
    NotFound(u32),

    /// A `/proc` file could not be parsed.
    #[error("malformed proc entry: {0}")]
    Parse(String),

    /// Operation not supported on this platform.
    #[error("not supported on this platform: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PlatformError {
    /// Creates a parse error.
    #[must_use]
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Creates an unsupported-platform error.
    #[must_use]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Returns true if the error means the process does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlatformError::NotFound(42);
        assert_eq!(err.to_string(), "process not found: 42");
    }

    #[test]
    fn test_is_not_found() {
        assert!(PlatformError::NotFound(1).is_not_found());
        assert!(!PlatformError::parse("junk").is_not_found());
    }
}
