use crate::errors::{RateLimitError, Result};
use crate::limiter::identity::Identity;
use crate::limiter::policy::Policy;
use crate::limiter::Decision;
use crate::storage::Storage;
use std::sync::Arc;

/// The rate-limit decision engine.
///
/// Pure orchestration of the business rules over a [`Storage`] backend:
/// an existing block takes precedence over the bucket, and a bucket that
/// empties on this call triggers a new block. All per-identity
/// serialization is delegated to the store; the engine holds no locks and
/// performs no I/O or logging of its own.
pub struct RateLimiter<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> RateLimiter<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Decides whether a request from `identity` may proceed under
    /// `policy`.
    ///
    /// The caller's `deadline` is threaded through to every store
    /// operation; it is the sole source of truth for operation timeout.
    ///
    /// Errors from the store propagate immediately with no compensating
    /// writes: if `set_block` fails after a denied consume, the denied
    /// bucket state is already persisted and the next request will simply
    /// re-deny and retry the block.
    pub async fn evaluate(
        &self,
        identity: &Identity,
        policy: &Policy,
        deadline: Option<std::time::Duration>,
    ) -> Result<Decision> {
        if !identity.is_valid() {
            return Err(RateLimitError::InvalidIdentity(format!(
                "identity value must be non-empty (kind: {})",
                identity.kind()
            )));
        }
        policy.validate()?;

        // An active penalty short-circuits before the bucket is touched,
        // so repeated evaluation while blocked never extends the penalty
        // and the bucket keeps refilling in the background.
        if self.storage.is_blocked(identity, deadline).await? {
            return Ok(Decision::PreBlocked);
        }

        let result = self
            .storage
            .check_and_consume(identity, policy.capacity, policy.window, deadline)
            .await?;

        if result.allowed {
            return Ok(Decision::Pass {
                remaining_tokens: result.current_tokens,
                limit: result.limit,
            });
        }

        self.storage
            .set_block(identity, policy.block_duration, deadline)
            .await?;

        Ok(Decision::JustExhausted {
            remaining_tokens: result.current_tokens,
            limit: result.limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CheckResult;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Scripted storage double recording the calls the engine makes.
    struct MockStorage {
        blocked: bool,
        is_blocked_fails: bool,
        consume_result: Option<CheckResult>,
        consume_fails: bool,
        set_block_fails: bool,
        calls: Mutex<Vec<String>>,
        deadlines: Mutex<Vec<Option<Duration>>>,
    }

    impl MockStorage {
        fn new() -> Self {
            Self {
                blocked: false,
                is_blocked_fails: false,
                consume_result: None,
                consume_fails: false,
                set_block_fails: false,
                calls: Mutex::new(Vec::new()),
                deadlines: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn deadlines(&self) -> Vec<Option<Duration>> {
            self.deadlines.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Storage for MockStorage {
        async fn check_and_consume(
            &self,
            identity: &Identity,
            _limit: u32,
            _window: Duration,
            deadline: Option<Duration>,
        ) -> Result<CheckResult> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("check_and_consume:{}", identity.storage_key()));
            self.deadlines.lock().unwrap().push(deadline);
            if self.consume_fails {
                return Err(RateLimitError::RedisCommandError("boom".to_string()));
            }
            Ok(self.consume_result.clone().expect("consume result not set"))
        }

        async fn set_block(
            &self,
            identity: &Identity,
            block_duration: Duration,
            deadline: Option<Duration>,
        ) -> Result<()> {
            self.calls.lock().unwrap().push(format!(
                "set_block:{}:{}ms",
                identity.storage_key(),
                block_duration.as_millis()
            ));
            self.deadlines.lock().unwrap().push(deadline);
            if self.set_block_fails {
                return Err(RateLimitError::RedisCommandError("boom".to_string()));
            }
            Ok(())
        }

        async fn is_blocked(&self, identity: &Identity, deadline: Option<Duration>) -> Result<bool> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("is_blocked:{}", identity.storage_key()));
            self.deadlines.lock().unwrap().push(deadline);
            if self.is_blocked_fails {
                return Err(RateLimitError::RedisCommandError("boom".to_string()));
            }
            Ok(self.blocked)
        }

        async fn health_check(&self) -> Result<()> {
            Ok(())
        }
    }

    fn policy() -> Policy {
        Policy::new(10, Duration::from_secs(1), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn pass_when_bucket_has_capacity() {
        let mut storage = MockStorage::new();
        storage.consume_result = Some(CheckResult {
            allowed: true,
            current_tokens: 9.0,
            limit: 10,
        });
        let storage = Arc::new(storage);
        let limiter = RateLimiter::new(Arc::clone(&storage));

        let decision = limiter
            .evaluate(&Identity::ip("192.168.1.1"), &policy(), None)
            .await
            .unwrap();

        assert_eq!(
            decision,
            Decision::Pass {
                remaining_tokens: 9.0,
                limit: 10
            }
        );
        assert!(decision.message().is_none());
        // A pass never touches the block flag.
        assert_eq!(
            storage.calls(),
            vec![
                "is_blocked:rate_limit:ip:192.168.1.1",
                "check_and_consume:rate_limit:ip:192.168.1.1",
            ]
        );
    }

    #[tokio::test]
    async fn pre_blocked_short_circuits_the_bucket() {
        let mut storage = MockStorage::new();
        storage.blocked = true;
        let storage = Arc::new(storage);
        let limiter = RateLimiter::new(Arc::clone(&storage));

        let decision = limiter
            .evaluate(&Identity::token("abc123"), &policy(), None)
            .await
            .unwrap();

        assert_eq!(decision, Decision::PreBlocked);
        assert!(decision.is_blocked());
        assert_eq!(
            decision.message(),
            Some(crate::limiter::RATE_LIMIT_EXCEEDED_MESSAGE)
        );
        assert_eq!(storage.calls(), vec!["is_blocked:rate_limit:token:abc123"]);
    }

    #[tokio::test]
    async fn exhausted_bucket_sets_the_block() {
        let mut storage = MockStorage::new();
        storage.consume_result = Some(CheckResult {
            allowed: false,
            current_tokens: 0.4,
            limit: 10,
        });
        let storage = Arc::new(storage);
        let limiter = RateLimiter::new(Arc::clone(&storage));

        let decision = limiter
            .evaluate(&Identity::ip("10.0.0.1"), &policy(), None)
            .await
            .unwrap();

        assert_eq!(
            decision,
            Decision::JustExhausted {
                remaining_tokens: 0.4,
                limit: 10
            }
        );
        // Denied but not pre-blocked: the penalty starts on this call.
        assert!(!decision.is_blocked());
        assert_eq!(
            storage.calls(),
            vec![
                "is_blocked:rate_limit:ip:10.0.0.1",
                "check_and_consume:rate_limit:ip:10.0.0.1",
                "set_block:rate_limit:ip:10.0.0.1:300000ms",
            ]
        );
    }

    #[tokio::test]
    async fn caller_deadline_reaches_every_store_operation() {
        let mut storage = MockStorage::new();
        storage.consume_result = Some(CheckResult {
            allowed: false,
            current_tokens: 0.0,
            limit: 10,
        });
        let storage = Arc::new(storage);
        let limiter = RateLimiter::new(Arc::clone(&storage));

        let deadline = Some(Duration::from_millis(250));
        limiter
            .evaluate(&Identity::ip("10.0.0.1"), &policy(), deadline)
            .await
            .unwrap();

        // is_blocked, check_and_consume and set_block all saw it.
        assert_eq!(storage.deadlines(), vec![deadline; 3]);
    }

    #[tokio::test]
    async fn invalid_identity_is_rejected_before_any_io() {
        let storage = Arc::new(MockStorage::new());
        let limiter = RateLimiter::new(Arc::clone(&storage));

        let err = limiter
            .evaluate(&Identity::ip(""), &policy(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, RateLimitError::InvalidIdentity(_)));
        assert!(storage.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_policy_is_rejected_before_any_io() {
        let storage = Arc::new(MockStorage::new());
        let limiter = RateLimiter::new(Arc::clone(&storage));

        let bad = Policy::new(0, Duration::from_secs(1), Duration::ZERO);
        let err = limiter
            .evaluate(&Identity::ip("10.0.0.1"), &bad, None)
            .await
            .unwrap_err();

        assert!(matches!(err, RateLimitError::ConfigurationError(_)));
        assert!(storage.calls().is_empty());
    }

    #[tokio::test]
    async fn is_blocked_error_propagates() {
        let mut storage = MockStorage::new();
        storage.is_blocked_fails = true;
        let limiter = RateLimiter::new(Arc::new(storage));

        let err = limiter
            .evaluate(&Identity::ip("10.0.0.1"), &policy(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::RedisCommandError(_)));
    }

    #[tokio::test]
    async fn set_block_error_propagates_after_denial() {
        let mut storage = MockStorage::new();
        storage.consume_result = Some(CheckResult {
            allowed: false,
            current_tokens: 0.0,
            limit: 10,
        });
        storage.set_block_fails = true;
        let limiter = RateLimiter::new(Arc::new(storage));

        let err = limiter
            .evaluate(&Identity::ip("10.0.0.1"), &policy(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::RedisCommandError(_)));
    }
}
