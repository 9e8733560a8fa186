//! Single-process [`Storage`] backend.
//!
//! Holds every bucket behind one async mutex, which gives the same
//! per-identity atomicity guarantee as the Redis script within a single
//! process. Used by tests and available as a backend where no shared
//! state across instances is needed.

use crate::errors::{RateLimitError, Result};
use crate::limiter::identity::Identity;
use crate::storage::{CheckResult, Storage, BUCKET_IDLE_TTL};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Token count as of the last consume; refill since then is derived
    /// from `last_refill`, never persisted on the denied branch.
    tokens: f64,
    last_refill: Instant,
}

#[derive(Default)]
struct Inner {
    buckets: HashMap<String, Bucket>,
    /// Block flags mapped to their absolute expiry.
    blocks: HashMap<String, Instant>,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the state lock, honoring the caller's deadline.
    async fn lock_with_deadline(
        &self,
        deadline: Option<Duration>,
    ) -> Result<tokio::sync::MutexGuard<'_, Inner>> {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, self.inner.lock())
                .await
                .map_err(|_| {
                    RateLimitError::InternalError(
                        "deadline exceeded waiting for bucket lock".to_string(),
                    )
                }),
            None => Ok(self.inner.lock().await),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
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

        let capacity = limit as f64;
        let now = Instant::now();
        let key = identity.storage_key();

        let mut inner = self.lock_with_deadline(deadline).await?;

        let stored = inner
            .buckets
            .get(&key)
            .copied()
            // Idle state past its TTL is as good as gone.
            .filter(|b| now.duration_since(b.last_refill) < BUCKET_IDLE_TTL)
            .unwrap_or(Bucket {
                tokens: capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(stored.last_refill).as_secs_f64();
        let refill_rate = capacity / window.as_secs_f64();
        let tokens = capacity.min(stored.tokens + elapsed * refill_rate);

        if tokens >= 1.0 {
            let tokens = tokens - 1.0;
            inner.buckets.insert(
                key,
                Bucket {
                    tokens,
                    last_refill: now,
                },
            );
            Ok(CheckResult {
                allowed: true,
                current_tokens: tokens,
                limit,
            })
        } else {
            // Advance the refill baseline only; the stored token count
            // keeps reflecting the last consumed state.
            inner.buckets.insert(
                key,
                Bucket {
                    tokens: stored.tokens,
                    last_refill: now,
                },
            );
            Ok(CheckResult {
                allowed: false,
                current_tokens: tokens,
                limit,
            })
        }
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

        let mut inner = self.lock_with_deadline(deadline).await?;
        inner
            .blocks
            .insert(identity.storage_key(), Instant::now() + block_duration);
        Ok(())
    }

    async fn is_blocked(&self, identity: &Identity, deadline: Option<Duration>) -> Result<bool> {
        let key = identity.storage_key();
        let now = Instant::now();

        let mut inner = self.lock_with_deadline(deadline).await?;
        match inner.blocks.get(&key) {
            Some(expiry) if *expiry > now => Ok(true),
            Some(_) => {
                inner.blocks.remove(&key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(value: &str) -> Identity {
        Identity::ip(value)
    }

    #[tokio::test]
    async fn fresh_bucket_starts_full_and_consumes_one() {
        let storage = MemoryStorage::new();
        let result = storage
            .check_and_consume(&ip("192.168.1.1"), 10, Duration::from_secs(1), None)
            .await
            .unwrap();

        assert!(result.allowed);
        assert_eq!(result.current_tokens, 9.0);
        assert_eq!(result.limit, 10);
    }

    #[tokio::test]
    async fn drained_bucket_denies_until_refill() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        for _ in 0..10 {
            let result = storage
                .check_and_consume(&identity, 10, Duration::from_secs(1), None)
                .await
                .unwrap();
            assert!(result.allowed);
        }

        let result = storage
            .check_and_consume(&identity, 10, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(!result.allowed);
        assert!(result.current_tokens < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_at_capacity_over_window() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        for _ in 0..10 {
            storage
                .check_and_consume(&identity, 10, Duration::from_secs(1), None)
                .await
                .unwrap();
        }

        // 500ms at 10 tokens/s refills 5 tokens; one is consumed here.
        tokio::time::advance(Duration::from_millis(500)).await;
        let result = storage
            .check_and_consume(&identity, 10, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(result.allowed);
        assert!((result.current_tokens - 4.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        storage
            .check_and_consume(&identity, 5, Duration::from_secs(1), None)
            .await
            .unwrap();

        // Two full windows of idle time must cap at 5, not accumulate to 9.
        tokio::time::advance(Duration::from_secs(2)).await;
        let result = storage
            .check_and_consume(&identity, 5, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.current_tokens, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn denied_branch_does_not_double_credit_refill() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        // Drain a 2-token bucket.
        for _ in 0..2 {
            storage
                .check_and_consume(&identity, 2, Duration::from_secs(10), None)
                .await
                .unwrap();
        }

        // 1s at 0.2 tokens/s accrues 0.2 tokens: denied, baseline advances.
        tokio::time::advance(Duration::from_secs(1)).await;
        let first = storage
            .check_and_consume(&identity, 2, Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(!first.allowed);

        // Another 1s accrues 0.2 more on top of the *stored* zero, not on
        // top of the previously computed 0.2 plus the full elapsed again.
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = storage
            .check_and_consume(&identity, 2, Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(!second.allowed);
        assert!((second.current_tokens - 0.2).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bucket_state_expires() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        for _ in 0..10 {
            storage
                .check_and_consume(&identity, 10, Duration::from_secs(36000), None)
                .await
                .unwrap();
        }

        // Past the idle TTL the drained state is gone and the bucket is
        // fresh again (a mere refill over this window would only have
        // restored one token).
        tokio::time::advance(BUCKET_IDLE_TTL).await;
        let result = storage
            .check_and_consume(&identity, 10, Duration::from_secs(36000), None)
            .await
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.current_tokens, 9.0);
    }

    #[tokio::test(start_paused = true)]
    async fn block_flag_expires_after_duration() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        storage
            .set_block(&identity, Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(storage.is_blocked(&identity, None).await.unwrap());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!storage.is_blocked(&identity, None).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn set_block_refreshes_the_expiry() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        storage
            .set_block(&identity, Duration::from_secs(2), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;

        // Refresh: the new expiry counts from the second call.
        storage
            .set_block(&identity, Duration::from_secs(2), None)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(storage.is_blocked(&identity, None).await.unwrap());

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(!storage.is_blocked(&identity, None).await.unwrap());
    }

    #[tokio::test]
    async fn never_blocked_without_a_preceding_set_block() {
        let storage = MemoryStorage::new();
        assert!(!storage.is_blocked(&ip("192.168.1.1"), None).await.unwrap());
    }

    #[tokio::test]
    async fn zero_parameters_are_configuration_errors() {
        let storage = MemoryStorage::new();
        let identity = ip("192.168.1.1");

        assert!(storage
            .check_and_consume(&identity, 0, Duration::from_secs(1), None)
            .await
            .is_err());
        assert!(storage
            .check_and_consume(&identity, 10, Duration::ZERO, None)
            .await
            .is_err());
        assert!(storage.set_block(&identity, Duration::ZERO, None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_respected_while_the_lock_is_held() {
        let storage = MemoryStorage::new();

        // Hold the state lock so the call can only end via its deadline.
        let guard = storage.inner.lock().await;
        let err = storage
            .check_and_consume(
                &ip("192.168.1.1"),
                10,
                Duration::from_secs(1),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::InternalError(_)));
        drop(guard);
    }

    #[tokio::test]
    async fn concurrent_consumes_never_exceed_capacity() {
        let storage = std::sync::Arc::new(MemoryStorage::new());
        let identity = ip("192.168.1.1");

        let mut handles = Vec::new();
        for _ in 0..20 {
            let storage = std::sync::Arc::clone(&storage);
            let identity = identity.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .check_and_consume(&identity, 10, Duration::from_secs(3600), None)
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        // A slow window makes mid-test refill negligible: exactly the
        // initial tokens may be consumed.
        assert_eq!(allowed, 10);
    }
}
