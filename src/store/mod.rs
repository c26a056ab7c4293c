//! Bucket state stores and the atomic update contract.
//!
//! A [`BucketStore`] runs the read of the previous state, the decision and the
//! conditional write as one indivisible step per key. Stores that can only
//! offer versioned reads and compare-and-swap writes implement
//! [`VersionedStore`] and are lifted to a [`BucketStore`] by [`CasAdapter`].
//! Optimistic updates can run out of retries under heavy contention on one
//! key; [`RedisStore`] avoids this for rate limit decisions by evaluating the
//! whole policy server-side.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::{decide, BucketKey, BucketPolicy, BucketState, Transition, Verdict};

mod cas;
mod memory;
mod redis;

pub use self::cas::{CasAdapter, DEFAULT_MAX_ATTEMPTS};
pub use self::memory::InMemoryStore;
pub use self::redis::{RawState, RedisStore};

/// The decision step run inside a store's atomic section.
///
/// Compare-and-swap stores may run it more than once per update.
pub type UpdateFn<'a> = &'a (dyn Fn(Option<&BucketState>) -> Transition + Send + Sync);

/// Trait for bucket state stores.
///
/// Implementations must make `atomic_update` linearizable per key: two
/// concurrent updates of the same key behave as if run one after the other.
/// Different keys must not contend with each other.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Atomically load the state for `key`, run `update` on it, and persist
    /// the new state if there is one.
    ///
    /// A persisted state gets its expiry refreshed to `ttl`, or no expiry if
    /// `ttl` is `None`. When `update` produces no new state nothing is
    /// written and any existing expiry is left alone.
    async fn atomic_update(
        &self,
        key: &BucketKey,
        ttl: Option<Duration>,
        update: UpdateFn<'_>,
    ) -> Result<Verdict, StoreError>;

    /// Read the current state for `key` without deciding anything.
    async fn snapshot(&self, key: &BucketKey) -> Result<Option<BucketState>, StoreError>;

    /// Atomically decide the next action for `key` under `policy` at `now_ms`,
    /// persisting the consumed token on success.
    ///
    /// The default runs [`decide`] through [`atomic_update`](Self::atomic_update).
    /// Stores able to evaluate the policy next to the data override it.
    async fn evaluate(
        &self,
        key: &BucketKey,
        policy: &BucketPolicy,
        now_ms: u64,
    ) -> Result<Verdict, StoreError> {
        self.atomic_update(key, policy.ttl(), &|previous| decide(policy, previous, now_ms))
            .await
    }
}

/// A state read together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<V> {
    pub state: Option<BucketState>,
    pub version: V,
}

/// Trait for stores offering optimistic concurrency instead of exclusive
/// access.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Opaque marker of the stored state a read observed.
    type Version: Send + Sync;

    /// Read the state for `key` and its version.
    async fn load(&self, key: &BucketKey) -> Result<Versioned<Self::Version>, StoreError>;

    /// Write `next` for `key` only if the stored state is still at `expected`.
    ///
    /// Returns `false` without writing if another writer got there first.
    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: &Self::Version,
        next: &BucketState,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;
}

/// Errors that can occur in storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command against the store failed.
    #[error("Query error: {0}")]
    Query(String),

    /// Every compare-and-swap attempt lost to a concurrent writer.
    #[error("Update abandoned after {attempts} conflicting attempts")]
    Conflict {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Stored values could not be read back as bucket state.
    #[error("Corrupt state for {key}: {reason}")]
    Corrupt {
        /// The affected store key.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}
