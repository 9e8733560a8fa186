//! Redis-backed [`Storage`] implementation.
//!
//! The compound read-refill-consume-write step runs as a Lua script so it
//! is atomic per identity regardless of how many processes share the
//! Redis instance. `now` is sampled once per call and shipped to the
//! script, which clamps negative elapsed time to zero.

pub mod pool;
pub mod script;

use crate::errors::{RateLimitError, Result};
use crate::limiter::identity::Identity;
use crate::metrics;
use crate::storage::{CheckResult, Storage};
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RedisStorage {
    pool: Arc<Pool>,
    command_timeout: Duration,
}

impl RedisStorage {
    /// Create a new Redis storage, registering the Lua script up front.
    pub async fn new(pool: Pool) -> Result<Self> {
        let pool = Arc::new(pool);

        let mut conn = pool.get().await.map_err(|e| {
            RateLimitError::InternalError(format!(
                "Failed to get connection for script loading: {}",
                e
            ))
        })?;
        let _sha = script::load_script(&mut *conn).await?;

        Ok(Self {
            pool,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        })
    }

    /// Safety-net timeout applied to a command when the caller supplies
    /// no tighter deadline; the effective per-call timeout is the
    /// smaller of the two.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn effective_timeout(&self, deadline: Option<Duration>) -> Duration {
        effective_timeout(self.command_timeout, deadline)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        self.pool.get().await.map_err(|e| {
            error!("Failed to get Redis connection: {}", e);
            metrics::record_redis_error("pool");
            RateLimitError::RedisConnectionError(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "Pool exhausted",
                e.to_string(),
            )))
        })
    }

    fn unix_now() -> Result<i64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .map_err(|e| {
                RateLimitError::InternalError(format!("system clock before unix epoch: {}", e))
            })
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn check_and_consume(
        &self,
        identity: &Identity,
        limit: u32,
        window: Duration,
        deadline: Option<Duration>,
    ) -> Result<CheckResult> {
        if limit == 0 {
            return Err(RateLimitError::ConfigurationError(
                "limit must be positive".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(RateLimitError::ConfigurationError(
                "window must be positive".to_string(),
            ));
        }

        let key = identity.storage_key();
        let tokens_key = format!("{}:tokens", key);
        let last_refill_key = format!("{}:last_refill", key);
        let now = Self::unix_now()?;

        let mut conn = self.connection().await?;

        debug!(
            "Executing token bucket script: key={}, limit={}, window={:?}",
            key, limit, window
        );

        let script = script::get_script();
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.effective_timeout(deadline),
            script
                .key(&tokens_key)
                .key(&last_refill_key)
                .arg(limit)
                .arg(window.as_secs_f64())
                .arg(now)
                .invoke_async::<Vec<redis::Value>>(&mut *conn),
        )
        .await
            .map_err(|_| {
                metrics::record_redis_error("timeout");
                metrics::record_script_execution(false);
                RateLimitError::RedisCommandError(format!(
                    "token bucket script timed out for key {}",
                    key
                ))
            })?
            .map_err(|e| {
                error!("Script execution failed: {}", e);
                metrics::record_redis_error("script");
                metrics::record_script_execution(false);
                RateLimitError::ScriptExecutionError(format!(
                    "script execution failed for key {}: {}",
                    key, e
                ))
            })?;

        metrics::record_redis_duration("token_bucket", started.elapsed().as_secs_f64());
        metrics::record_script_execution(true);

        let (allowed, current_tokens) = parse_script_result(&result).map_err(|e| {
            RateLimitError::ScriptExecutionError(format!(
                "failed to parse script result for key {}: {}",
                key, e
            ))
        })?;

        debug!(
            "Script result: key={}, allowed={}, tokens={:.2}",
            key, allowed, current_tokens
        );

        Ok(CheckResult {
            allowed,
            current_tokens,
            limit,
        })
    }

    async fn set_block(
        &self,
        identity: &Identity,
        block_duration: Duration,
        deadline: Option<Duration>,
    ) -> Result<()> {
        if block_duration.is_zero() {
            return Err(RateLimitError::ConfigurationError(format!(
                "block duration must be positive for key {}",
                identity.storage_key()
            )));
        }

        let block_key = format!("{}:blocked", identity.storage_key());
        let mut conn = self.connection().await?;

        // Absolute expiry at now + block_duration; a repeat call simply
        // refreshes the window.
        let started = Instant::now();
        tokio::time::timeout(
            self.effective_timeout(deadline),
            redis::cmd("SET")
                .arg(&block_key)
                .arg("1")
                .arg("PX")
                .arg((block_duration.as_millis() as u64).max(1))
                .query_async::<()>(&mut *conn),
        )
        .await
            .map_err(|_| {
                metrics::record_redis_error("timeout");
                RateLimitError::RedisCommandError(format!(
                    "set block timed out for key {}",
                    identity.storage_key()
                ))
            })?
            .map_err(|e| {
                metrics::record_redis_error("command");
                RateLimitError::RedisCommandError(format!(
                    "failed to set block for key {}: {}",
                    identity.storage_key(),
                    e
                ))
            })?;

        metrics::record_redis_duration("set_block", started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn is_blocked(&self, identity: &Identity, deadline: Option<Duration>) -> Result<bool> {
        let block_key = format!("{}:blocked", identity.storage_key());
        let mut conn = self.connection().await?;

        let started = Instant::now();
        let exists = tokio::time::timeout(
            self.effective_timeout(deadline),
            conn.exists::<_, i64>(&block_key),
        )
        .await
            .map_err(|_| {
                metrics::record_redis_error("timeout");
                RateLimitError::RedisCommandError(format!(
                    "block check timed out for key {}",
                    identity.storage_key()
                ))
            })?
            .map_err(|e| {
                metrics::record_redis_error("command");
                RateLimitError::RedisCommandError(format!(
                    "failed to check block status for key {}: {}",
                    identity.storage_key(),
                    e
                ))
            })?;

        metrics::record_redis_duration("is_blocked", started.elapsed().as_secs_f64());
        Ok(exists > 0)
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;

        let response: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(RateLimitError::RedisConnectionError)?;

        if response != "PONG" {
            return Err(RateLimitError::InternalError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

/// The caller's deadline is the source of truth; the configured command
/// timeout only applies when it is tighter or no deadline was given.
fn effective_timeout(command_timeout: Duration, deadline: Option<Duration>) -> Duration {
    match deadline {
        Some(limit) => limit.min(command_timeout),
        None => command_timeout,
    }
}

/// Parse the script reply: [allowed (int), current_tokens, capacity].
///
/// Lua returns the token count as a bulk string to preserve the
/// fractional part; integer and double replies are tolerated for
/// compatibility with RESP3 conversions.
fn parse_script_result(result: &[redis::Value]) -> Result<(bool, f64)> {
    if result.len() != 3 {
        return Err(RateLimitError::ScriptExecutionError(format!(
            "expected 3 elements in result array, got {}: {:?}",
            result.len(),
            result
        )));
    }

    let allowed = match &result[0] {
        redis::Value::Int(v) => *v == 1,
        other => {
            return Err(RateLimitError::ScriptExecutionError(format!(
                "invalid allowed flag type: {:?}",
                other
            )))
        }
    };

    let current_tokens = parse_tokens_value(&result[1])?;

    Ok((allowed, current_tokens))
}

fn parse_tokens_value(value: &redis::Value) -> Result<f64> {
    match value {
        redis::Value::BulkString(bytes) => {
            let s = std::str::from_utf8(bytes).map_err(|e| {
                RateLimitError::ScriptExecutionError(format!("invalid UTF-8 in tokens value: {}", e))
            })?;
            s.parse::<f64>().map_err(|e| {
                RateLimitError::ScriptExecutionError(format!(
                    "failed to parse tokens value '{}': {}",
                    s, e
                ))
            })
        }
        redis::Value::Int(v) => Ok(*v as f64),
        redis::Value::Double(v) => Ok(*v),
        other => Err(RateLimitError::ScriptExecutionError(format!(
            "unexpected tokens value type: {:?}",
            other
        ))),
    }
}
