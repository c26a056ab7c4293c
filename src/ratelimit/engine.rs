//! The token bucket decision engine.
//!
//! [`decide`] is a pure function of the policy, the previously persisted state
//! and the current time. It performs no I/O; store adapters call it inside
//! their atomic section and persist whatever state it hands back.

use tracing::trace;

use super::policy::BucketPolicy;
use super::state::BucketState;

/// Outcome of a single decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The action is permitted and one token was consumed.
    Allowed,
    /// The previous allowed action was less than the minimum spacing ago.
    TooSoon {
        /// Milliseconds until the spacing constraint is satisfied.
        retry_after_ms: u64,
    },
    /// The bucket holds no whole token.
    Depleted {
        /// Milliseconds for one token to regenerate.
        retry_after_ms: u64,
    },
    /// The bucket holds no whole token and never refills.
    Exhausted,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

/// Result of running the engine: the verdict plus the state to persist.
///
/// `next` is `None` on every denial, which leaves stored state untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub verdict: Verdict,
    pub next: Option<BucketState>,
}

impl Transition {
    fn denied(verdict: Verdict) -> Self {
        Self {
            verdict,
            next: None,
        }
    }
}

/// Decide whether the next action is permitted at `now_ms`.
///
/// Spacing is checked before tokens, so a full bucket never admits a request
/// that comes too soon after the last allowed one.
pub fn decide(policy: &BucketPolicy, previous: Option<&BucketState>, now_ms: u64) -> Transition {
    let capacity = policy.capacity() as f64;
    let min_difference = policy.min_difference_ms();

    if let Some(prev) = previous {
        // A clock behind the stored timestamp counts as no time elapsed.
        let elapsed = now_ms.saturating_sub(prev.last_timestamp_ms);
        if min_difference > 0 && elapsed < min_difference {
            trace!(elapsed, min_difference, "Minimum spacing not satisfied");
            return Transition::denied(Verdict::TooSoon {
                retry_after_ms: min_difference - elapsed,
            });
        }
    }

    let refilled = match previous {
        None => capacity,
        Some(prev) => {
            let elapsed = now_ms.saturating_sub(prev.last_timestamp_ms) as f64;
            (prev.tokens + elapsed * policy.fill_rate()).min(capacity)
        }
    };

    // Flooring only gates the branch; the fractional part is what gets stored.
    if refilled.floor() < 1.0 {
        trace!(refilled, "No whole token available");
        let verdict = match policy.refill_period_ms() {
            Some(retry_after_ms) => Verdict::Depleted { retry_after_ms },
            None => Verdict::Exhausted,
        };
        return Transition::denied(verdict);
    }

    let last_timestamp_ms = previous.map_or(now_ms, |prev| prev.last_timestamp_ms.max(now_ms));

    Transition {
        verdict: Verdict::Allowed,
        next: Some(BucketState::new(refilled - 1.0, last_timestamp_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::policy::Window;

    fn policy(capacity: u64, window: Window, min_difference_ms: u64) -> BucketPolicy {
        BucketPolicy::new(capacity, window, min_difference_ms).unwrap()
    }

    #[test]
    fn test_first_decision_starts_full() {
        let policy = policy(5, Window::Millis(1000), 0);

        let transition = decide(&policy, None, 1_000);

        assert_eq!(transition.verdict, Verdict::Allowed);
        assert_eq!(transition.next, Some(BucketState::new(4.0, 1_000)));
    }

    #[test]
    fn test_absence_equals_full_bucket_at_minus_infinity() {
        let policy = policy(3, Window::Millis(3000), 500);
        let full = BucketState::new(3.0, 0);

        let from_absent = decide(&policy, None, 1_000_000);
        let from_full = decide(&policy, Some(&full), 1_000_000);

        assert_eq!(from_absent, from_full);
    }

    #[test]
    fn test_depleted_bucket_reports_refill_period() {
        let policy = policy(2, Window::Millis(2000), 0);
        let state = BucketState::new(0.0, 1_000);

        let transition = decide(&policy, Some(&state), 1_000);

        assert_eq!(transition.verdict, Verdict::Depleted { retry_after_ms: 1000 });
        assert_eq!(transition.next, None);
    }

    #[test]
    fn test_fractional_tokens_are_kept_on_success() {
        let policy = policy(2, Window::Millis(4000), 0);
        let state = BucketState::new(0.0, 0);

        // 3000ms at 0.0005 tokens/ms regenerates 1.5 tokens
        let transition = decide(&policy, Some(&state), 3_000);

        assert_eq!(transition.verdict, Verdict::Allowed);
        assert_eq!(transition.next, Some(BucketState::new(0.5, 3_000)));
    }

    #[test]
    fn test_fractional_accrual_is_discarded_on_denial() {
        let policy = policy(2, Window::Millis(4000), 0);
        let state = BucketState::new(0.0, 0);

        // 0.5 tokens regenerated: not enough, and nothing is persisted
        let transition = decide(&policy, Some(&state), 1_000);

        assert_eq!(transition.verdict, Verdict::Depleted { retry_after_ms: 2000 });
        assert!(transition.next.is_none());
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let policy = policy(4, Window::Millis(1000), 0);
        let state = BucketState::new(1.0, 0);

        let transition = decide(&policy, Some(&state), 1_000_000);

        assert_eq!(transition.next, Some(BucketState::new(3.0, 1_000_000)));
    }

    #[test]
    fn test_spacing_overrides_full_bucket() {
        let policy = policy(10, Window::Unbounded, 2000);
        let state = BucketState::new(9.0, 5_000);

        let transition = decide(&policy, Some(&state), 5_300);

        assert_eq!(transition.verdict, Verdict::TooSoon { retry_after_ms: 1700 });
        assert!(transition.next.is_none());
    }

    #[test]
    fn test_spacing_satisfied_exactly_at_boundary() {
        let policy = policy(10, Window::Unbounded, 2000);
        let state = BucketState::new(9.0, 5_000);

        let transition = decide(&policy, Some(&state), 7_000);

        assert_eq!(transition.verdict, Verdict::Allowed);
        assert_eq!(transition.next, Some(BucketState::new(8.0, 7_000)));
    }

    #[test]
    fn test_spacing_checked_before_tokens() {
        let policy = policy(1, Window::Millis(60_000), 1000);
        let state = BucketState::new(0.0, 10_000);

        let transition = decide(&policy, Some(&state), 10_400);

        assert_eq!(transition.verdict, Verdict::TooSoon { retry_after_ms: 600 });
    }

    #[test]
    fn test_unbounded_window_exhausts() {
        let policy = policy(1, Window::Unbounded, 0);

        let first = decide(&policy, None, 0);
        assert_eq!(first.verdict, Verdict::Allowed);

        let state = first.next.unwrap();
        let second = decide(&policy, Some(&state), 10_000_000);
        assert_eq!(second.verdict, Verdict::Exhausted);
        assert!(second.next.is_none());
    }

    #[test]
    fn test_clock_behind_stored_timestamp() {
        let policy = policy(3, Window::Millis(3000), 100);
        let state = BucketState::new(2.0, 10_000);

        // Spacing waits the full minimum difference
        let transition = decide(&policy, Some(&state), 9_000);
        assert_eq!(transition.verdict, Verdict::TooSoon { retry_after_ms: 100 });

        // Without spacing the timestamp never moves backwards
        let policy = BucketPolicy::new(3, Window::Millis(3000), 0).unwrap();
        let transition = decide(&policy, Some(&state), 9_000);
        assert_eq!(transition.next, Some(BucketState::new(1.0, 10_000)));
    }
}
