pub mod loader;
pub mod validator;

use crate::limiter::policy::Policy;
use std::collections::HashMap;
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Redis connection configuration
    pub redis: RedisConfig,

    /// Rate limiting policies
    pub limits: LimitsConfig,
}

/// Redis connection configuration (loaded from environment variables)
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis URL (e.g., "redis://localhost:6379")
    pub url: String,

    /// Maximum number of connections in pool
    pub max_connections: usize,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,

    /// Command timeout in seconds
    pub command_timeout_secs: u64,
}

impl RedisConfig {
    /// Load Redis configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            max_connections: std::env::var("REDIS_MAX_CONN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),

            connection_timeout_secs: std::env::var("REDIS_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),

            command_timeout_secs: std::env::var("REDIS_COMMAND_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_connections: 50,
            connection_timeout_secs: 5,
            command_timeout_secs: 2,
        }
    }
}

/// Rate limiting policy configuration
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Default policy applied to IP identities
    pub ip_policy: Policy,

    /// Token value → policy overrides
    pub token_policies: HashMap<String, Policy>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_policy: Policy::new(10, Duration::from_secs(1), Duration::from_secs(300)),
            token_policies: HashMap::new(),
        }
    }
}
