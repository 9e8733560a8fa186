use thiserror::Error;

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Redis connection error: {0}")]
    RedisConnectionError(#[from] redis::RedisError),

    #[error("Redis command error: {0}")]
    RedisCommandError(String),

    #[error("Script execution error: {0}")]
    ScriptExecutionError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for rate limiter operations
pub type Result<T> = std::result::Result<T, RateLimitError>;
