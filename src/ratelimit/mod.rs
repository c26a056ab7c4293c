//! Rate limiting logic and state management.

mod clock;
mod engine;
mod key;
mod limiter;
mod policy;
mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{decide, Transition, Verdict};
pub use key::BucketKey;
pub use limiter::{Decision, RateLimiter};
pub use policy::{BucketPolicy, Window};
pub use state::BucketState;
