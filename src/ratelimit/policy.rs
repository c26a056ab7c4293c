//! Validated token bucket policy.

use std::time::Duration;

use crate::error::{BucketeerError, Result};

/// The window over which `capacity` tokens are regenerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// The bucket refills completely over this many milliseconds.
    Millis(u64),
    /// The bucket never refills; `capacity` is a fixed allowance.
    Unbounded,
}

impl Window {
    /// Build a window from an optional length, where `None` means unbounded.
    pub fn from_millis(millis: Option<u64>) -> Self {
        match millis {
            Some(ms) => Window::Millis(ms),
            None => Window::Unbounded,
        }
    }
}

/// Token bucket plus minimum spacing, shared by every identifier it governs.
///
/// Construction validates the parameters, so a `BucketPolicy` in hand is always
/// usable by the decision engine.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketPolicy {
    capacity: u64,
    window: Window,
    min_difference_ms: u64,
    fill_rate: f64,
}

impl BucketPolicy {
    /// Create a policy allowing `capacity` actions per `window`, with at least
    /// `min_difference_ms` between two consecutive allowed actions.
    pub fn new(capacity: u64, window: Window, min_difference_ms: u64) -> Result<Self> {
        if capacity == 0 {
            return Err(BucketeerError::Config(
                "max_in_interval must be a positive integer".to_string(),
            ));
        }

        let fill_rate = match window {
            Window::Millis(0) => {
                return Err(BucketeerError::Config(
                    "interval must be a positive number of milliseconds or unbounded".to_string(),
                ));
            }
            Window::Millis(ms) => capacity as f64 / ms as f64,
            Window::Unbounded => 0.0,
        };

        Ok(Self {
            capacity,
            window,
            min_difference_ms,
            fill_rate,
        })
    }

    /// Maximum number of tokens a bucket can hold.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Tokens regenerated per millisecond; zero for an unbounded window.
    pub fn fill_rate(&self) -> f64 {
        self.fill_rate
    }

    pub fn min_difference_ms(&self) -> u64 {
        self.min_difference_ms
    }

    /// Time for a single token to regenerate (`1 / fill_rate`), rounded up to
    /// whole milliseconds. `None` when the bucket never refills.
    pub fn refill_period_ms(&self) -> Option<u64> {
        match self.window {
            // Divide the integers rather than inverting the rate so that exact
            // periods such as 2000 / 2 stay exact.
            Window::Millis(ms) => Some(ms.div_ceil(self.capacity)),
            Window::Unbounded => None,
        }
    }

    /// Sliding expiry applied to persisted state on every mutation: the window
    /// rounded up to whole seconds, or `None` if state never expires.
    pub fn ttl(&self) -> Option<Duration> {
        match self.window {
            Window::Millis(ms) => Some(Duration::from_secs(ms.div_ceil(1000))),
            Window::Unbounded => None,
        }
    }
}
