pub mod memory;
pub mod redis;

use crate::errors::Result;
use crate::limiter::identity::Identity;
use async_trait::async_trait;
use std::time::Duration;

/// Idle TTL after which bucket state is eligible for garbage collection.
pub const BUCKET_IDLE_TTL: Duration = Duration::from_secs(3600);

/// Result of an atomic check-and-consume against a bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    /// Whether a token was consumed and the request may proceed.
    pub allowed: bool,

    /// Tokens left in the bucket after the check (real-valued; refill
    /// accumulates fractionally between whole-token consumptions).
    pub current_tokens: f64,

    /// The capacity the check ran against.
    pub limit: u32,
}

/// Shared per-identity rate-limit state.
///
/// Every operation must hold under concurrent callers across threads and
/// processes; the compound read-refill-consume-write step in
/// [`check_and_consume`] is atomic per identity.
///
/// Each operation takes an optional caller `deadline`, the sole source
/// of truth for operation timeout. Backends may apply their own
/// transport defaults as a safety net, but those never supersede a
/// tighter caller deadline.
///
/// [`check_and_consume`]: Storage::check_and_consume
#[async_trait]
pub trait Storage: Send + Sync {
    /// Atomically refills the identity's bucket and consumes one token
    /// if at least one whole token is available.
    ///
    /// Fails with a configuration error if `limit` is zero or `window`
    /// is zero.
    async fn check_and_consume(
        &self,
        identity: &Identity,
        limit: u32,
        window: Duration,
        deadline: Option<Duration>,
    ) -> Result<CheckResult>;

    /// Establishes or refreshes the identity's block flag with an
    /// absolute expiry of now + `block_duration`.
    ///
    /// Fails with a configuration error if `block_duration` is zero.
    async fn set_block(
        &self,
        identity: &Identity,
        block_duration: Duration,
        deadline: Option<Duration>,
    ) -> Result<()>;

    /// Whether the identity's block flag is present at call time.
    async fn is_blocked(&self, identity: &Identity, deadline: Option<Duration>) -> Result<bool>;

    /// Verifies the backend is reachable.
    async fn health_check(&self) -> Result<()>;
}
