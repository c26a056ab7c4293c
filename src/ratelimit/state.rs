//! Persisted per-identifier bucket state.

use serde::{Deserialize, Serialize};

/// State of one identifier's bucket.
///
/// A bucket without state is equivalent to a full bucket that has never seen a
/// successful action, so state only exists after the first allowed decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens left, with fractional accrual preserved.
    pub tokens: f64,
    /// Millisecond timestamp of the last allowed action.
    pub last_timestamp_ms: u64,
}

impl BucketState {
    pub fn new(tokens: f64, last_timestamp_ms: u64) -> Self {
        Self {
            tokens,
            last_timestamp_ms,
        }
    }
}
