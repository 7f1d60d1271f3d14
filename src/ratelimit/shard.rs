//! Counter keys and shard selection.
//!
//! A logical key names the budget a request draws from. To keep a single busy budget
//! from turning into one hot key in the store, it is split across `shard_count` physical
//! keys. The shard is picked per call from the request's fresh unique id, not from the
//! caller, so a caller's requests scatter across shards and each shard enforces its share
//! of the limit.

use super::rules::Rule;

/// Separator between a logical key and its shard index.
pub const SHARD_SEPARATOR: &str = ":shard:";

/// Build the logical key for a matched rule and an optional caller identity.
///
/// Format: `{prefix}{rule path}` or `{prefix}{rule path}:caller:{identity}`.
pub fn logical_key(prefix: &str, rule: &Rule, caller: Option<&str>) -> String {
    match caller {
        Some(identity) => format!("{}{}:caller:{}", prefix, rule.path, identity),
        None => format!("{}{}", prefix, rule.path),
    }
}

/// Spreads a logical key over a fixed number of physical keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSelector {
    shard_count: u32,
}

impl ShardSelector {
    /// Create a selector. A shard count of zero is treated as one.
    pub fn new(shard_count: u32) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Pick the physical key for a request carrying the unique id `id`.
    ///
    /// With a single shard the logical key is used unchanged.
    pub fn shard_key(&self, logical_key: &str, id: u64) -> String {
        if self.shard_count == 1 {
            return logical_key.to_string();
        }
        let shard = id % self.shard_count as u64;
        format!("{}{}{}", logical_key, SHARD_SEPARATOR, shard)
    }

    /// The share of `limit` each shard admits, never below one.
    pub fn per_shard_limit(&self, limit: u64) -> u64 {
        (limit / self.shard_count as u64).max(1)
    }
}
