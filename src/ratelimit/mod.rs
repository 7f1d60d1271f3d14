//! Sliding-window admission control.

mod clock;
mod controller;
mod retry;
mod rules;
mod shard;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{AdmissionController, AdmissionControllerBuilder, Decision, DecisionReason};
pub use retry::{RetryPolicy, DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_MAX_ATTEMPTS};
pub use rules::{Rule, RuleTable, MAX_WINDOW_SECS, WILDCARD};
pub use shard::{logical_key, ShardSelector, SHARD_SEPARATOR};
pub use window::{window_ttl_secs, WindowRequest, WindowStore, SLIDING_WINDOW_SCRIPT};
