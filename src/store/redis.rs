//! Redis-backed bucket state store.
//!
//! Each bucket is stored as two plain string keys, `{key}:token` and
//! `{key}:timestamp`. Rate limit decisions run entirely inside Redis: a Lua
//! script reads both keys, applies the spacing, refill and consumption steps,
//! and writes the new state only when the action is allowed. Redis runs the
//! script atomically, so concurrent decisions on one key never conflict.
//!
//! Arbitrary updates through [`BucketStore::atomic_update`] read the state with
//! a pipelined `GET` and commit with a compare-and-set script, retrying when
//! another writer got there first.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{info, trace, warn};

use super::cas::{update_with_retries, DEFAULT_MAX_ATTEMPTS};
use super::{BucketStore, StoreError, UpdateFn, Versioned, VersionedStore};
use crate::ratelimit::{BucketKey, BucketPolicy, BucketState, Verdict};

/// Decides one action for a bucket and consumes a token if it is allowed.
///
/// Replies `{code, retry_after_ms}` where the code is 0 allowed, 1 too soon,
/// 2 depleted, 3 exhausted, or -1 for unreadable stored values. A TTL of zero
/// stores the values without expiry.
const TOKEN_BUCKET: &str = r#"
local token_key = KEYS[1]
local timestamp_key = KEYS[2]

local capacity = tonumber(ARGV[1])
local fill_rate = tonumber(ARGV[2])
local refill_period_ms = tonumber(ARGV[3])
local min_difference_ms = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])
local now_ms = tonumber(ARGV[6])

local stored_tokens = redis.call("GET", token_key)
local stored_timestamp = redis.call("GET", timestamp_key)

local tokens = capacity
local last_ms = nil

if stored_tokens and stored_timestamp then
    tokens = tonumber(stored_tokens)
    last_ms = tonumber(stored_timestamp)
    if tokens == nil or last_ms == nil or tokens ~= tokens or tokens < 0 or tokens == math.huge or last_ms < 0 then
        return {-1, 0}
    end

    local elapsed = math.max(0, now_ms - last_ms)
    if min_difference_ms > 0 and elapsed < min_difference_ms then
        return {1, min_difference_ms - elapsed}
    end

    tokens = math.min(capacity, tokens + elapsed * fill_rate)
end

if math.floor(tokens) < 1 then
    if refill_period_ms > 0 then
        return {2, refill_period_ms}
    end
    return {3, 0}
end

local timestamp = now_ms
if last_ms and last_ms > now_ms then
    timestamp = last_ms
end

local encoded_tokens = string.format("%.17g", tokens - 1)
local encoded_timestamp = string.format("%.0f", timestamp)

if ttl_ms > 0 then
    redis.call("SET", token_key, encoded_tokens, "PX", ttl_ms)
    redis.call("SET", timestamp_key, encoded_timestamp, "PX", ttl_ms)
else
    redis.call("SET", token_key, encoded_tokens)
    redis.call("SET", timestamp_key, encoded_timestamp)
end

return {0, 0}
"#;

/// Writes both sub-keys if they still hold the expected values.
///
/// Absent keys are passed and compared as the empty string, which is never a
/// stored value. A TTL of zero stores the values without expiry.
const COMPARE_AND_SET: &str = r#"
local token_key = KEYS[1]
local timestamp_key = KEYS[2]

local expected_tokens = ARGV[1]
local expected_timestamp = ARGV[2]
local tokens = ARGV[3]
local timestamp = ARGV[4]
local ttl_ms = tonumber(ARGV[5])

local current_tokens = redis.call("GET", token_key) or ""
local current_timestamp = redis.call("GET", timestamp_key) or ""

if current_tokens ~= expected_tokens or current_timestamp ~= expected_timestamp then
    return 0
end

if ttl_ms > 0 then
    redis.call("SET", token_key, tokens, "PX", ttl_ms)
    redis.call("SET", timestamp_key, timestamp, "PX", ttl_ms)
else
    redis.call("SET", token_key, tokens)
    redis.call("SET", timestamp_key, timestamp)
end

return 1
"#;

/// Expiry argument for the scripts: whole milliseconds, at least one for any
/// expiry, or zero for none.
fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map_or(0, |ttl| {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    })
}

/// Map a token bucket script reply to a verdict.
fn verdict_from_reply(key: &BucketKey, code: i64, retry_after_ms: i64) -> Result<Verdict, StoreError> {
    let retry_after_ms = u64::try_from(retry_after_ms).unwrap_or(0);
    match code {
        0 => Ok(Verdict::Allowed),
        1 => Ok(Verdict::TooSoon { retry_after_ms }),
        2 => Ok(Verdict::Depleted { retry_after_ms }),
        3 => Ok(Verdict::Exhausted),
        -1 => Err(StoreError::Corrupt {
            key: key.to_string_key(),
            reason: "stored values are not a token count and timestamp".to_string(),
        }),
        other => Err(StoreError::Query(format!(
            "Unexpected token bucket reply code {other}"
        ))),
    }
}

/// Raw stored values of a bucket, used as its version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawState {
    pub tokens: Option<String>,
    pub timestamp: Option<String>,
}

impl RawState {
    /// Decode the stored values.
    ///
    /// A bucket with only one of its two keys present (one expired a moment
    /// before the other) reads as absent.
    fn decode(&self, key: &BucketKey) -> Result<Option<BucketState>, StoreError> {
        let (Some(tokens), Some(timestamp)) = (&self.tokens, &self.timestamp) else {
            return Ok(None);
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.to_string_key(),
            reason,
        };

        let tokens: f64 = tokens
            .parse()
            .map_err(|e| corrupt(format!("token count {tokens:?}: {e}")))?;
        if !tokens.is_finite() || tokens < 0.0 {
            return Err(corrupt(format!("token count {tokens} out of range")));
        }

        let last_timestamp_ms: u64 = timestamp
            .parse()
            .map_err(|e| corrupt(format!("timestamp {timestamp:?}: {e}")))?;

        Ok(Some(BucketState::new(tokens, last_timestamp_ms)))
    }
}

/// Redis bucket state store.
pub struct RedisStore {
    connection_manager: ConnectionManager,
    token_bucket: Script,
    compare_and_set: Script,
    max_cas_attempts: u32,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("token_bucket", &self.token_bucket.get_hash())
            .field("compare_and_set", &self.compare_and_set.get_hash())
            .field("max_cas_attempts", &self.max_cas_attempts)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Connection(format!("Invalid Redis URL: {e}")))?;

        let connection_manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to Redis: {e}")))?;

        info!("Connected to Redis bucket store");
        Ok(Self::from_connection_manager(connection_manager))
    }

    /// Use an existing connection manager.
    pub fn from_connection_manager(connection_manager: ConnectionManager) -> Self {
        Self {
            connection_manager,
            token_bucket: Script::new(TOKEN_BUCKET),
            compare_and_set: Script::new(COMPARE_AND_SET),
            max_cas_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Give up an [`atomic_update`](BucketStore::atomic_update) after
    /// `max_attempts` lost races. A budget of zero is raised to one.
    ///
    /// Rate limit decisions run server-side and are not subject to it.
    pub fn with_max_cas_attempts(mut self, max_attempts: u32) -> Self {
        self.max_cas_attempts = max_attempts.max(1);
        self
    }

    pub fn max_cas_attempts(&self) -> u32 {
        self.max_cas_attempts
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn atomic_update(
        &self,
        key: &BucketKey,
        ttl: Option<Duration>,
        update: UpdateFn<'_>,
    ) -> Result<Verdict, StoreError> {
        update_with_retries(self, key, ttl, update, self.max_cas_attempts).await
    }

    async fn snapshot(&self, key: &BucketKey) -> Result<Option<BucketState>, StoreError> {
        Ok(self.load(key).await?.state)
    }

    async fn evaluate(
        &self,
        key: &BucketKey,
        policy: &BucketPolicy,
        now_ms: u64,
    ) -> Result<Verdict, StoreError> {
        let mut conn = self.connection_manager.clone();

        let (code, retry_after_ms): (i64, i64) = self
            .token_bucket
            .key(key.token_key())
            .key(key.timestamp_key())
            .arg(policy.capacity())
            .arg(policy.fill_rate().to_string())
            .arg(policy.refill_period_ms().unwrap_or(0))
            .arg(policy.min_difference_ms())
            .arg(ttl_millis(policy.ttl()))
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, code, retry_after_ms, "Evaluated bucket");

        verdict_from_reply(key, code, retry_after_ms).inspect_err(|e| {
            warn!(key = %key, error = %e, "Token bucket script failed");
        })
    }
}

#[async_trait]
impl VersionedStore for RedisStore {
    type Version = RawState;

    async fn load(&self, key: &BucketKey) -> Result<Versioned<RawState>, StoreError> {
        let mut conn = self.connection_manager.clone();

        let (tokens, timestamp): (Option<String>, Option<String>) = redis::pipe()
            .get(key.token_key())
            .get(key.timestamp_key())
            .query_async(&mut conn)
            .await?;

        let raw = RawState { tokens, timestamp };
        trace!(key = %key, raw = ?raw, "Loaded bucket");

        let state = raw.decode(key).inspect_err(|e| {
            warn!(key = %key, error = %e, "Unreadable bucket state");
        })?;

        Ok(Versioned {
            state,
            version: raw,
        })
    }

    async fn compare_and_swap(
        &self,
        key: &BucketKey,
        expected: &RawState,
        next: &BucketState,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection_manager.clone();

        let swapped: i64 = self
            .compare_and_set
            .key(key.token_key())
            .key(key.timestamp_key())
            .arg(expected.tokens.as_deref().unwrap_or(""))
            .arg(expected.timestamp.as_deref().unwrap_or(""))
            .arg(next.tokens.to_string())
            .arg(next.last_timestamp_ms.to_string())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(swapped == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(tokens: Option<&str>, timestamp: Option<&str>) -> RawState {
        RawState {
            tokens: tokens.map(str::to_string),
            timestamp: timestamp.map(str::to_string),
        }
    }

    #[test]
    fn test_decode_full_state() {
        let key = BucketKey::new("ns", "foo");
        let state = raw(Some("1.5"), Some("1700000000000")).decode(&key).unwrap();
        assert_eq!(state, Some(BucketState::new(1.5, 1_700_000_000_000)));
    }

    #[test]
    fn test_decode_missing_keys_is_absent() {
        let key = BucketKey::new("ns", "foo");
        assert_eq!(raw(None, None).decode(&key).unwrap(), None);
        assert_eq!(raw(Some("1"), None).decode(&key).unwrap(), None);
        assert_eq!(raw(None, Some("5")).decode(&key).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let key = BucketKey::new("ns", "foo");

        let err = raw(Some("lots"), Some("5")).decode(&key).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let err = raw(Some("-1"), Some("5")).decode(&key).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let err = raw(Some("NaN"), Some("5")).decode(&key).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));

        let err = raw(Some("1"), Some("yesterday")).decode(&key).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "nsfoo"));
    }

    #[test]
    fn test_token_encoding_keeps_fraction() {
        let key = BucketKey::new("ns", "foo");
        let state = BucketState::new(0.1 + 0.2, 42);

        let encoded = raw(Some(&state.tokens.to_string()), Some("42"));
        assert_eq!(encoded.decode(&key).unwrap(), Some(state));
    }

    #[test]
    fn test_script_encoding_is_readable() {
        // The token bucket script writes %.17g tokens and %.0f timestamps
        let key = BucketKey::new("ns", "foo");
        let encoded = raw(Some("0.30000000000000004"), Some("1700000003000"));
        assert_eq!(
            encoded.decode(&key).unwrap(),
            Some(BucketState::new(0.1 + 0.2, 1_700_000_003_000))
        );
    }

    #[test]
    fn test_ttl_millis_keeps_sub_second_expiry() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::from_secs(10))), 10_000);
        assert_eq!(ttl_millis(Some(Duration::from_millis(500))), 500);
        assert_eq!(ttl_millis(Some(Duration::from_micros(300))), 1);
        assert_eq!(ttl_millis(Some(Duration::ZERO)), 1);
    }

    #[test]
    fn test_verdict_from_reply() {
        let key = BucketKey::new("ns", "foo");

        assert_eq!(verdict_from_reply(&key, 0, 0).unwrap(), Verdict::Allowed);
        assert_eq!(
            verdict_from_reply(&key, 1, 1990).unwrap(),
            Verdict::TooSoon { retry_after_ms: 1990 }
        );
        assert_eq!(
            verdict_from_reply(&key, 2, 1000).unwrap(),
            Verdict::Depleted { retry_after_ms: 1000 }
        );
        assert_eq!(verdict_from_reply(&key, 3, 0).unwrap(), Verdict::Exhausted);

        let err = verdict_from_reply(&key, -1, 0).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "nsfoo"));

        let err = verdict_from_reply(&key, 7, 0).unwrap_err();
        assert!(matches!(err, StoreError::Query(_)));
    }
}
