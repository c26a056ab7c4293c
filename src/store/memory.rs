//! In-process bucket state store.
//!
//! Every key owns its own lock, so decisions for one identifier are
//! serialized while different identifiers proceed independently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{BucketStore, StoreError, UpdateFn, Versioned, VersionedStore};
use crate::ratelimit::{BucketKey, BucketState, Clock, SystemClock, Verdict};

/// Stored state of one bucket.
#[derive(Debug, Default)]
struct Slot {
    state: Option<BucketState>,
    expires_at_ms: Option<u64>,
    version: u64,
    /// Set once the slot has been removed from the map. Holders of a retired
    /// slot must look the key up again.
    retired: bool,
}

impl Slot {
    fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.expires_at_ms, Some(at) if now_ms >= at)
    }

    fn live_state(&self, now_ms: u64) -> Option<BucketState> {
        if self.is_expired(now_ms) {
            None
        } else {
            self.state
        }
    }

    fn write(&mut self, next: BucketState, ttl: Option<Duration>, now_ms: u64, version: u64) {
        self.state = Some(next);
        self.expires_at_ms = ttl.map(|ttl| now_ms.saturating_add(ttl.as_millis() as u64));
        self.version = version;
    }
}

/// In-memory bucket state store.
///
/// Expired buckets read as absent; [`InMemoryStore::purge_expired`] reclaims
/// their memory.
#[derive(Debug)]
pub struct InMemoryStore {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    clock: Arc<dyn Clock>,
    versions: AtomicU64,
}

impl InMemoryStore {
    /// Create a new store expiring state by wall clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new store expiring state by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: DashMap::new(),
            clock,
            versions: AtomicU64::new(0),
        }
    }

    /// Run `f` on the live slot for `key` with its lock held.
    fn with_slot<T>(&self, key: &str, mut f: impl FnMut(&mut Slot) -> T) -> T {
        loop {
            // The map guard is released before the slot lock is taken
            let slot = self.slots.entry(key.to_string()).or_default().clone();
            let mut guard = slot.lock();
            if guard.retired {
                trace!(key = %key, "Slot was purged concurrently, retrying");
                continue;
            }
            return f(&mut guard);
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Remaining expiry of the bucket at `key`.
    ///
    /// Returns `None` if there is no live state or it never expires.
    pub fn ttl(&self, key: &BucketKey) -> Option<Duration> {
        let slot = self.slots.get(&key.to_string_key())?.clone();
        let guard = slot.lock();
        let now = self.clock.now_millis();
        guard.live_state(now)?;
        guard
            .expires_at_ms
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    /// Get the number of buckets held, including expired ones not yet purged.
    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    /// Remove expired and empty buckets, returning how many were removed.
    ///
    /// Buckets whose lock is currently held are skipped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;

        self.slots.retain(|_, slot| {
            let Some(mut guard) = slot.try_lock() else {
                return true;
            };
            if guard.live_state(now).is_some() {
                return true;
            }
            guard.retired = true;
            removed += 1;
            false
        });

        if removed > 0 {
            debug!(removed, "Purged expired buckets");
        }
        removed
    }

    /// Purge expired buckets every `every` until the store is dropped.
    pub fn spawn_purge_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
        })
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BucketStore for InMemoryStore {
    async fn atomic_update(
        &self,
        key: &BucketKey,
        ttl: Option<Duration>,
        update: UpdateFn<'_>,
    ) -> Result<Verdict, StoreError> {
        let verdict = self.with_slot(&key.to_string_key(), |slot| {
            let now = self.clock.now_millis();
            let transition = update(slot.live_state(now).as_ref());
            if let Some(next) = transition.next {
                slot.write(next, ttl, now, self.next_version());
            }
            transition.verdict
        });

        Ok(verdict)
    }

    async fn snapshot(&self, key: &BucketKey) -> Result<Option<BucketState>, StoreError> {
        let Some(slot) = self.slots.get(&key.to_string_key()).map(|s| s.clone()) else {
            return Ok(None);
        };
        let guard = slot.lock();
        Ok(guard.live_state(self.clock.now_millis()))
    }
}

#[async_trait]
impl VersionedStore for InMemoryStore {
    type Version = u64;

    async fn load(&self, key: &BucketKey) -> Result<Versioned<u64>, StoreError> {
        let now = self.clock.now_millis();
        Ok(self.with_slot(&key.to_string_key(), |slot| Versioned {
            state: slot.live_state(now),
            version: slot.version,
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: &u64,
        next: &BucketState,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        Ok(self.with_slot(&key.to_string_key(), |slot| {
            if slot.version != *expected {
                return false;
            }
            slot.write(*next, ttl, self.clock.now_millis(), self.next_version());
            true
        }))
    }
}
