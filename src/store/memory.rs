//! In-process window store.
//!
//! Behaves like the Redis script: per-key sorted sets, inclusive eviction cutoff,
//! count before insert, and a key expiry measured against the request's own clock.
//! Expired keys are swept at most once per [`SWEEP_INTERVAL_MS`] of request time, so
//! keys that are never touched again do not pile up.
//! Only useful within one process, so it backs local runs and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use crate::error::StoreError;
use crate::ratelimit::{WindowRequest, WindowStore};

/// Minimum request-time gap between two sweeps of expired keys.
pub const SWEEP_INTERVAL_MS: i64 = 1_000;

#[derive(Debug, Default)]
struct WindowSet {
    /// (score, member), ordered by score
    entries: BTreeSet<(i64, String)>,
    expires_at_ms: i64,
}

/// Sorted sets kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: DashMap<String, WindowSet>,
    last_sweep_ms: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries currently stored under `key`, expired or not.
    pub fn len(&self, key: &str) -> usize {
        self.keys.get(key).map(|set| set.entries.len()).unwrap_or(0)
    }

    /// Number of keys held.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Keys held, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.keys.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.keys.clear();
    }

    /// Drop every key whose expiry is at or before `now_ms`.
    pub fn purge_expired(&self, now_ms: i64) {
        let before = self.keys.len();
        self.keys
            .retain(|_, set| set.expires_at_ms == 0 || set.expires_at_ms > now_ms);
        let removed = before.saturating_sub(self.keys.len());
        if removed > 0 {
            debug!(removed = removed, "Swept expired window keys");
        }
    }

    fn maybe_sweep(&self, now_ms: i64) {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < SWEEP_INTERVAL_MS {
            return;
        }
        // one caller wins the sweep for this interval
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.purge_expired(now_ms);
        }
    }
}

fn expiry_ms(request: &WindowRequest) -> i64 {
    let ttl_ms = i64::try_from(request.ttl_secs)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000);
    request.now_ms.saturating_add(ttl_ms)
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn count_and_insert(&self, request: &WindowRequest) -> Result<u64, StoreError> {
        // must run before the entry guard is taken: retain locks every shard
        self.maybe_sweep(request.now_ms);

        // The entry guard holds the shard lock, so the four steps are atomic per key.
        let mut set = self.keys.entry(request.key.clone()).or_default();

        if set.expires_at_ms != 0 && set.expires_at_ms <= request.now_ms {
            set.entries.clear();
        }

        let cutoff = request.cutoff_ms();
        set.entries.retain(|(score, _)| *score > cutoff);

        let count = set.entries.len() as u64;
        set.entries.insert((request.now_ms, request.member.clone()));
        set.expires_at_ms = expiry_ms(request);

        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
