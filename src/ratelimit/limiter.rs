//! Core rate limiter implementation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::engine::Verdict;
use super::key::BucketKey;
use super::policy::BucketPolicy;
use super::state::BucketState;
use crate::error::{BucketeerError, Result};
use crate::store::BucketStore;

/// Prefix of generated namespaces.
const DEFAULT_NAMESPACE_PREFIX: &str = "bucketeer-";

/// The answer given to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the action may proceed.
    pub allowed: bool,
    /// Milliseconds to wait before retrying; zero when allowed.
    pub retry_after_ms: u64,
}

impl Decision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: 0,
        }
    }

    fn denied(retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
        }
    }
}

/// The rate limiter that applies one policy to many identifiers.
///
/// Each identifier gets its own bucket in the store, keyed under the
/// limiter's namespace. This struct is thread-safe and can be shared across
/// multiple tasks.
#[derive(Debug)]
pub struct RateLimiter<S: BucketStore + ?Sized> {
    policy: BucketPolicy,
    namespace: String,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: BucketStore + ?Sized> RateLimiter<S> {
    /// Create a rate limiter with a random namespace and the system clock.
    ///
    /// Two limiters created this way never share buckets, even on the same
    /// store.
    pub fn new(policy: BucketPolicy, store: Arc<S>) -> Self {
        Self {
            policy,
            namespace: format!("{}{}", DEFAULT_NAMESPACE_PREFIX, uuid::Uuid::new_v4().simple()),
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a fixed namespace, so that limiters in other processes with the
    /// same namespace share buckets.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Use a different clock for decision timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the store key for an identifier.
    pub fn key(&self, identifier: &str) -> BucketKey {
        BucketKey::new(&self.namespace, identifier)
    }

    /// Decide whether the next action for `identifier` is permitted now.
    pub async fn decide(&self, identifier: &str) -> Result<Decision> {
        self.decide_at(identifier, self.clock.now_millis()).await
    }

    /// Decide whether the next action for `identifier` is permitted at `now_ms`.
    ///
    /// Allowed decisions consume a token and are persisted; denials leave the
    /// stored state untouched.
    pub async fn decide_at(&self, identifier: &str, now_ms: u64) -> Result<Decision> {
        let key = self.key(identifier);

        trace!(key = %key, now_ms, "Checking rate limit");

        let verdict = self.store.evaluate(&key, &self.policy, now_ms).await?;

        let decision = match verdict {
            Verdict::Allowed => Decision::allowed(),
            Verdict::TooSoon { retry_after_ms } => {
                debug!(key = %key, retry_after_ms, "Minimum spacing not yet elapsed");
                Decision::denied(retry_after_ms)
            }
            Verdict::Depleted { retry_after_ms } => {
                debug!(key = %key, retry_after_ms, "Rate limit exceeded");
                Decision::denied(retry_after_ms)
            }
            Verdict::Exhausted => {
                debug!(key = %key, "Allowance exhausted and never refills");
                return Err(BucketeerError::Exhausted {
                    key: key.to_string_key(),
                });
            }
        };

        Ok(decision)
    }

    /// Decide for the single global bucket of this limiter.
    pub async fn decide_global(&self) -> Result<Decision> {
        self.decide("").await
    }

    /// Get the stored state for `identifier`, if any.
    pub async fn inspect(&self, identifier: &str) -> Result<Option<BucketState>> {
        Ok(self.store.snapshot(&self.key(identifier)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{ManualClock, Window};
    use crate::store::{CasAdapter, InMemoryStore};
    use std::time::Duration;

    fn limiter(capacity: u64, window: Window, min_difference_ms: u64) -> RateLimiter<InMemoryStore> {
        let policy = BucketPolicy::new(capacity, window, min_difference_ms).unwrap();
        RateLimiter::new(policy, Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_rate_limiter_creation() {
        let limiter = limiter(10, Window::Millis(1000), 0);
        assert!(limiter.namespace().starts_with("bucketeer-"));
        assert_eq!(limiter.store().bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_generated_namespaces_differ() {
        let store = Arc::new(InMemoryStore::new());
        let policy = BucketPolicy::new(1, Window::Millis(1000), 0).unwrap();
        let first = RateLimiter::new(policy.clone(), store.clone());
        let second = RateLimiter::new(policy, store);

        assert_ne!(first.namespace(), second.namespace());
        assert!(first.decide_at("foo", 0).await.unwrap().allowed);
        assert!(second.decide_at("foo", 0).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_decide_consumes_tokens() {
        let limiter = limiter(2, Window::Millis(2000), 0);

        assert_eq!(limiter.decide_at("foo", 0).await.unwrap(), Decision::allowed());
        assert_eq!(limiter.decide_at("foo", 0).await.unwrap(), Decision::allowed());
        assert_eq!(
            limiter.decide_at("foo", 0).await.unwrap(),
            Decision::denied(1000)
        );

        let state = limiter.inspect("foo").await.unwrap().unwrap();
        assert_eq!(state, BucketState::new(0.0, 0));
    }

    #[tokio::test]
    async fn test_identifiers_have_separate_buckets() {
        let limiter = limiter(1, Window::Millis(1000), 0);

        assert!(limiter.decide_at("a", 0).await.unwrap().allowed);
        assert!(limiter.decide_at("b", 0).await.unwrap().allowed);
        assert!(!limiter.decide_at("a", 0).await.unwrap().allowed);
        assert_eq!(limiter.store().bucket_count(), 2);
    }

    #[tokio::test]
    async fn test_global_bucket_uses_namespace_as_key() {
        let limiter = limiter(1, Window::Millis(1000), 0).with_namespace("global");

        assert!(limiter.decide_global().await.unwrap().allowed);
        assert_eq!(limiter.key("").to_string_key(), "global");
        assert!(limiter.inspect("").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_exhausted_unbounded_bucket_is_an_error() {
        let limiter = limiter(1, Window::Unbounded, 0).with_namespace("ns-");

        assert!(limiter.decide_at("foo", 0).await.unwrap().allowed);

        let err = limiter.decide_at("foo", 60_000).await.unwrap_err();
        assert!(matches!(err, BucketeerError::Exhausted { ref key } if key == "ns-foo"));
    }

    #[tokio::test]
    async fn test_decide_reads_injected_clock() {
        let clock = Arc::new(ManualClock::new(10_000));
        let limiter = limiter(5, Window::Unbounded, 1000).with_clock(clock.clone());

        assert!(limiter.decide("foo").await.unwrap().allowed);

        clock.advance(Duration::from_millis(400));
        assert_eq!(limiter.decide("foo").await.unwrap(), Decision::denied(600));

        clock.advance(Duration::from_millis(600));
        assert!(limiter.decide("foo").await.unwrap().allowed);
        assert_eq!(
            limiter.inspect("foo").await.unwrap(),
            Some(BucketState::new(3.0, 11_000))
        );
    }

    #[tokio::test]
    async fn test_works_over_cas_adapter() {
        let policy = BucketPolicy::new(1, Window::Millis(1000), 0).unwrap();
        let limiter = RateLimiter::new(policy, Arc::new(CasAdapter::new(InMemoryStore::new())));

        assert!(limiter.decide_at("foo", 0).await.unwrap().allowed);
        assert_eq!(limiter.decide_at("foo", 0).await.unwrap(), Decision::denied(1000));
        assert!(limiter.decide_at("foo", 1000).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_dyn_store() {
        let store: Arc<dyn BucketStore> = Arc::new(InMemoryStore::new());
        let policy = BucketPolicy::new(1, Window::Millis(1000), 0).unwrap();
        let limiter = RateLimiter::new(policy, store);

        assert!(limiter.decide_at("foo", 0).await.unwrap().allowed);
        assert!(!limiter.decide_at("foo", 1).await.unwrap().allowed);
    }
}
