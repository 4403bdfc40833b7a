//! Configuration error types.

/// Result type alias for config operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur while loading or resolving configuration.
///
/// All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read a config file.
    #[error("failed to read config file '{path}': {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    /// Failed to parse TOML (including unknown cluster or expiration modes).
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A backend address could not be parsed.
    #[error("invalid backend address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Missing required field.
    #[error("missing required field '{field}' in {context}")]
    MissingField { field: String, context: String },

    /// A value is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
