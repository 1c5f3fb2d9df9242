use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while throttling requests
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// Invalid policy values or missing backend connection parameters.
    /// Fatal at construction time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or answered with an error.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A record came back from the store in a state that cannot be valid.
    #[error("Invariant violation for key '{key}': {reason}")]
    InvariantViolation { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether this error came from the counter store rather than from configuration
    pub fn is_backend(&self) -> bool {
        matches!(self, RateLimitError::BackendUnavailable(_))
    }
}

impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        RateLimitError::BackendUnavailable(e.to_string())
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(e: config::ConfigError) -> Self {
        RateLimitError::Config(e.to_string())
    }
}

impl From<serde_yaml::Error> for RateLimitError {
    fn from(e: serde_yaml::Error) -> Self {
        RateLimitError::Config(format!("Failed to parse YAML: {}", e))
    }
}
