//! Sliding-window counting contract.
//!
//! One call evicts expired entries, reads how many remain, records the current request
//! and refreshes the key's expiry. The store must run the four steps as one indivisible
//! unit: it is the only synchronization point between every instance sharing it.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

/// Lua body executed atomically by Redis for each counted request.
///
/// KEYS[1] window key, ARGV[1] eviction cutoff (inclusive), ARGV[2] now,
/// ARGV[3] member, ARGV[4] ttl seconds. Returns the cardinality before the insert.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
redis.call('EXPIRE', KEYS[1], tonumber(ARGV[4]))
return count
"#;

/// Parameters of one count-and-insert call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
    /// Physical (sharded) key
    pub key: String,
    /// Score of the new entry
    pub now_ms: i64,
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Value of the new entry, unique per request
    pub member: String,
    /// Expiry applied to the whole key
    pub ttl_secs: u64,
}

impl WindowRequest {
    pub fn new(key: impl Into<String>, window: Duration, now_ms: i64, id: u64) -> Self {
        Self {
            key: key.into(),
            now_ms,
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            member: format!("{}-{}", now_ms, id),
            ttl_secs: window_ttl_secs(window),
        }
    }

    /// Entries scored at or below this are expired.
    pub fn cutoff_ms(&self) -> i64 {
        self.now_ms.saturating_sub(self.window_ms)
    }
}

/// Key expiry: the window rounded up to whole seconds, plus one.
pub fn window_ttl_secs(window: Duration) -> u64 {
    let secs = window.as_secs();
    let rounded = if window.subsec_nanos() > 0 { secs.saturating_add(1) } else { secs };
    rounded.saturating_add(1)
}

/// A shared store able to run the sliding-window step atomically.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Evict, count, insert and expire as one atomic operation.
    ///
    /// Returns the number of live entries before this request's entry was added.
    async fn count_and_insert(&self, request: &WindowRequest) -> Result<u64, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_request() {
        let req = WindowRequest::new("k", Duration::from_secs(10), 50_000, 7);
        assert_eq!(req.window_ms, 10_000);
        assert_eq!(req.cutoff_ms(), 40_000);
        assert_eq!(req.member, "50000-7");
        assert_eq!(req.ttl_secs, 11);
    }

    #[test]
    fn test_ttl_rounds_up() {
        assert_eq!(window_ttl_secs(Duration::from_secs(1)), 2);
        assert_eq!(window_ttl_secs(Duration::from_millis(1500)), 3);
        assert_eq!(window_ttl_secs(Duration::from_secs(60)), 61);
    }

    #[test]
    fn test_huge_window_saturates() {
        let req = WindowRequest::new("k", Duration::from_secs(u64::MAX), 50_000, 1);
        assert_eq!(req.window_ms, i64::MAX);
        assert_eq!(req.cutoff_ms(), 50_000 - i64::MAX);
        assert_eq!(req.ttl_secs, u64::MAX);
    }

    #[test]
    fn test_script_steps_in_order() {
        let evict = SLIDING_WINDOW_SCRIPT.find("ZREMRANGEBYSCORE").unwrap();
        let count = SLIDING_WINDOW_SCRIPT.find("ZCARD").unwrap();
        let insert = SLIDING_WINDOW_SCRIPT.find("ZADD").unwrap();
        let expire = SLIDING_WINDOW_SCRIPT.find("EXPIRE").unwrap();
        assert!(evict < count && count < insert && insert < expire);
    }
}
