//! Unique id sources.
//!
//! The limiter needs one value per request that is unique enough, combined with a
//! millisecond timestamp, to keep same-instant entries apart in the window set. The same
//! value picks the shard a request lands on.

use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Supplies a fresh id per call.
pub trait IdSource: Send + Sync + std::fmt::Debug {
    fn next_id(&self) -> u64;
}

/// 2024-01-01T00:00:00Z in milliseconds.
const SNOWFLAKE_EPOCH_MS: i64 = 1_704_067_200_000;
const NODE_BITS: u64 = 10;
const SEQUENCE_BITS: u64 = 12;
const MAX_NODE_ID: u16 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Snowflake-style ids: 41 bits of milliseconds, 10 bits of node, 12 bits of sequence.
///
/// The sequence keeps counting across milliseconds instead of resetting, so the low bits
/// rotate even under sparse traffic and `id % shards` stays spread out.
#[derive(Debug)]
pub struct SnowflakeIds {
    node_id: u64,
    state: Mutex<SnowflakeState>,
}

#[derive(Debug, Default)]
struct SnowflakeState {
    last_ms: i64,
    sequence: u64,
}

impl SnowflakeIds {
    /// Create a generator for a node. Ids above 1023 are rejected.
    pub fn new(node_id: u16) -> Option<Self> {
        if node_id > MAX_NODE_ID {
            return None;
        }
        Some(Self {
            node_id: node_id as u64,
            state: Mutex::new(SnowflakeState::default()),
        })
    }

    /// Create a generator with a random node id.
    pub fn with_random_node() -> Self {
        let node_id = rand::thread_rng().gen_range(0..=MAX_NODE_ID);
        Self {
            node_id: node_id as u64,
            state: Mutex::new(SnowflakeState::default()),
        }
    }

    pub fn node_id(&self) -> u16 {
        self.node_id as u16
    }

    fn next_at(&self, now_ms: i64) -> u64 {
        let mut state = self.state.lock();

        // Never move backwards, even if the wall clock does.
        let mut ms = now_ms.max(state.last_ms);
        state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
        if state.sequence == 0 && ms == state.last_ms {
            // sequence wrapped inside one millisecond, borrow the next one
            ms += 1;
        }
        state.last_ms = ms;

        let elapsed = (ms - SNOWFLAKE_EPOCH_MS).max(0) as u64;
        (elapsed << (NODE_BITS + SEQUENCE_BITS)) | (self.node_id << SEQUENCE_BITS) | state.sequence
    }
}

impl IdSource for SnowflakeIds {
    fn next_id(&self) -> u64 {
        self.next_at(chrono::Utc::now().timestamp_millis())
    }
}

/// Random ids taken from UUID v4.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIds;

impl IdSource for RandomIds {
    fn next_id(&self) -> u64 {
        uuid::Uuid::new_v4().as_u64_pair().1
    }
}

/// Deterministic counter, mostly for tests.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl SequentialIds {
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_snowflake_rejects_large_node() {
        assert!(SnowflakeIds::new(1024).is_none());
        assert_eq!(SnowflakeIds::new(1023).unwrap().node_id(), 1023);
    }

    #[test]
    fn test_snowflake_unique_within_millisecond() {
        let ids = SnowflakeIds::new(7).unwrap();
        let now = SNOWFLAKE_EPOCH_MS + 5_000;

        let seen: HashSet<u64> = (0..10_000).map(|_| ids.next_at(now)).collect();
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_snowflake_embeds_node() {
        let ids = SnowflakeIds::new(42).unwrap();
        let id = ids.next_at(SNOWFLAKE_EPOCH_MS + 1);
        assert_eq!((id >> SEQUENCE_BITS) & MAX_NODE_ID as u64, 42);
    }

    #[test]
    fn test_snowflake_low_bits_rotate_across_milliseconds() {
        let ids = SnowflakeIds::new(1).unwrap();
        let shards: HashSet<u64> = (0..8)
            .map(|i| ids.next_at(SNOWFLAKE_EPOCH_MS + i * 10) % 4)
            .collect();
        assert_eq!(shards.len(), 4);
    }

    #[test]
    fn test_snowflake_monotonic_when_clock_goes_back() {
        let ids = SnowflakeIds::new(1).unwrap();
        let first = ids.next_at(SNOWFLAKE_EPOCH_MS + 1_000);
        let second = ids.next_at(SNOWFLAKE_EPOCH_MS + 500);
        assert!(second > first);
    }

    #[test]
    fn test_sequential_ids() {
        let ids = SequentialIds::starting_at(10);
        assert_eq!(ids.next_id(), 10);
        assert_eq!(ids.next_id(), 11);
    }

    #[test]
    fn test_random_ids_differ() {
        let ids = RandomIds;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
