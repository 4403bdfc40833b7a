//! Error types for session operations.

/// Error type for session operations.
///
/// A missing session is never an error: lookups return `Ok(None)`.
/// Ownership conflicts are never errors either; they are counted by the
/// manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backing store failed. `transient` failures may succeed on retry.
    #[error("Backend error: {message}")]
    Backend { message: String, transient: bool },

    /// A stored record could not be decoded. Not retried.
    #[error("Malformed session record: {0}")]
    Decode(String),

    /// An attribute value could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session was invalidated and can no longer be used.
    #[error("Session has been invalidated: {0}")]
    InvalidSession(String),

    /// Attribute name reserved for repository metadata.
    #[error("Invalid attribute name: {0}")]
    InvalidAttribute(String),

    /// The expiry subscription exhausted its retry ladder.
    #[error("Expiry subscription abandoned after {attempts} attempts: {last_error}")]
    SubscriptionExhausted { attempts: usize, last_error: String },

    /// The expiry subscription failed with a non-transient error.
    #[error("Expiry subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Invalid configuration, detected at startup.
    #[error("Configuration error: {0}")]
    Config(#[from] stow_config::ConfigError),

    /// The manager has been closed.
    #[error("Session manager is closed")]
    Closed,
}

impl Error {
    /// Create a backend error.
    pub fn backend(message: impl Into<String>, transient: bool) -> Self {
        Self::Backend {
            message: message.into(),
            transient,
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend { transient: true, .. })
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_backend_errors_retry() {
        assert!(Error::backend("connection reset", true).is_transient());
        assert!(!Error::backend("WRONGTYPE", false).is_transient());
        assert!(!Error::Decode("short field".into()).is_transient());
        assert!(!Error::Closed.is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::SubscriptionExhausted {
            attempts: 13,
            last_error: "refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Expiry subscription abandoned after 13 attempts: refused"
        );
        assert_eq!(
            Error::backend("timeout", true).to_string(),
            "Backend error: timeout"
        );
    }
}
