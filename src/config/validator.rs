use crate::config::{AppConfig, RedisConfig};
use crate::errors::{RateLimitError, Result};
use crate::limiter::policy::Policy;
use tracing::{debug, warn};

/// Validate the entire application configuration
pub fn validate_config(config: &AppConfig) -> Result<()> {
    debug!("Validating configuration...");

    validate_redis_config(&config.redis)?;

    validate_policy(&config.limits.ip_policy, "ip default")?;
    for (token, policy) in &config.limits.token_policies {
        if token.is_empty() {
            return Err(RateLimitError::ConfigurationError(
                "Token value cannot be empty".to_string(),
            ));
        }
        validate_policy(policy, token)?;
    }

    debug!("Configuration validation successful");
    Ok(())
}

/// Validate Redis configuration
fn validate_redis_config(config: &RedisConfig) -> Result<()> {
    if config.url.is_empty() {
        return Err(RateLimitError::ConfigurationError(
            "Redis URL cannot be empty".to_string(),
        ));
    }

    if !config.url.starts_with("redis://") && !config.url.starts_with("rediss://") {
        return Err(RateLimitError::ConfigurationError(format!(
            "Invalid Redis URL format: {}. Must start with redis:// or rediss://",
            config.url
        )));
    }

    if config.max_connections == 0 {
        return Err(RateLimitError::ConfigurationError(
            "max_connections must be greater than 0".to_string(),
        ));
    }

    if config.max_connections > 1000 {
        warn!(
            "max_connections is very high ({}). This may consume excessive resources.",
            config.max_connections
        );
    }

    if config.connection_timeout_secs == 0 {
        return Err(RateLimitError::ConfigurationError(
            "connection_timeout_secs must be greater than 0".to_string(),
        ));
    }

    if config.command_timeout_secs == 0 {
        return Err(RateLimitError::ConfigurationError(
            "command_timeout_secs must be greater than 0".to_string(),
        ));
    }

    debug!("Redis configuration valid");
    Ok(())
}

/// Validate an individual rate policy
fn validate_policy(policy: &Policy, name: &str) -> Result<()> {
    policy
        .validate()
        .map_err(|e| RateLimitError::ConfigurationError(format!("policy '{}': {}", name, e)))?;

    if policy.capacity > 1_000_000 {
        warn!(
            "Very high capacity ({}) for policy '{}'",
            policy.capacity, name
        );
    }

    if !policy.block_duration.is_zero() && policy.block_duration < policy.window {
        warn!(
            "Block duration {:?} for policy '{}' is shorter than its window {:?}",
            policy.block_duration, name, policy.window
        );
    }

    Ok(())
}
