//! Optimistic compare-and-swap execution of bucket updates.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{trace, warn};

use super::{BucketStore, StoreError, UpdateFn, VersionedStore};
use crate::ratelimit::{BucketKey, BucketState, Verdict};

/// Default number of attempts before an update is abandoned.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Runs bucket updates against a [`VersionedStore`] with a compare-and-swap
/// retry loop.
///
/// Each attempt loads the state and its version, runs the decision and, if
/// the decision produced new state, commits it only if the version is
/// unchanged. A lost race retries from a fresh read. Denials commit nothing,
/// so they never conflict.
///
/// The retry budget bounds the work per update, so with enough writers racing
/// on one key over a slow store some updates fail with
/// [`StoreError::Conflict`]. Such failures never admit an action.
#[derive(Debug)]
pub struct CasAdapter<S> {
    inner: S,
    max_attempts: u32,
}

impl<S: VersionedStore> CasAdapter<S> {
    /// Wrap a versioned store with the default retry budget.
    pub fn new(inner: S) -> Self {
        Self::with_max_attempts(inner, DEFAULT_MAX_ATTEMPTS)
    }

    /// Wrap a versioned store, giving up after `max_attempts` lost races.
    ///
    /// A budget of zero is raised to one.
    pub fn with_max_attempts(inner: S, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Get the wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Run `update` against `store` with a compare-and-swap retry loop.
///
/// Gives up with [`StoreError::Conflict`] after `max_attempts` lost races.
pub(super) async fn update_with_retries<S: VersionedStore + ?Sized>(
    store: &S,
    key: &BucketKey,
    ttl: Option<Duration>,
    update: UpdateFn<'_>,
    max_attempts: u32,
) -> Result<Verdict, StoreError> {
    for attempt in 1..=max_attempts {
        let loaded = store.load(key).await?;
        let transition = update(loaded.state.as_ref());

        let Some(next) = transition.next else {
            return Ok(transition.verdict);
        };

        if store
            .compare_and_swap(key, &loaded.version, &next, ttl)
            .await?
        {
            return Ok(transition.verdict);
        }

        trace!(key = %key, attempt, "Bucket changed under us, retrying");
    }

    warn!(
        key = %key,
        attempts = max_attempts,
        "Abandoning bucket update after repeated conflicts"
    );
    Err(StoreError::Conflict {
        attempts: max_attempts,
    })
}

#[async_trait]
impl<S: VersionedStore> BucketStore for CasAdapter<S> {
    async fn atomic_update(
        &self,
        key: &BucketKey,
        ttl: Option<Duration>,
        update: UpdateFn<'_>,
    ) -> Result<Verdict, StoreError> {
        update_with_retries(&self.inner, key, ttl, update, self.max_attempts).await
    }

    async fn snapshot(&self, key: &BucketKey) -> Result<Option<BucketState>, StoreError> {
        Ok(self.inner.load(key).await?.state)
    }
}
