//! Bucketeer - Distributed Token Bucket Rate Limiting
//!
//! This crate decides whether the next action for an identifier is permitted
//! under a replenishing token budget combined with a minimum spacing between
//! consecutive actions. Bucket state lives in a store shared by every caller,
//! and each decision is an atomic read-decide-write cycle against that store.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{BucketeerError, Result};
pub use ratelimit::{BucketPolicy, Decision, RateLimiter, Window};
