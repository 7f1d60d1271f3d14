//! Admission controller.
//!
//! Ties the pieces together for one request: resolve the rule for the path, build and
//! shard the counter key, run the sliding-window step through the retry policy, and turn
//! the pre-insert count into an allow/deny decision.
//!
//! Store failures never become an outage of the protected service: transient failures
//! that outlast the retries, and unclassified failures, admit the request and carry the
//! error on the decision. Undecodable replies follow the configured [`FailMode`].

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::{FailMode, FlowGuardConfig};
use crate::error::{FlowGuardError, Result, RetryError};
use crate::ids::{IdSource, SnowflakeIds};
use crate::metrics::{HttpReporter, MetricsSink, NoopSink};

use super::clock::{Clock, SystemClock};
use super::retry::RetryPolicy;
use super::rules::{Rule, RuleTable};
use super::shard::{logical_key, ShardSelector};
use super::window::{WindowRequest, WindowStore};

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// No rule matches the path; nothing was counted
    NoRule,
    /// Count was below the limit
    WithinLimit,
    /// Count had reached the limit
    OverLimit,
    /// The store failed and the request was admitted anyway
    FailOpen,
    /// The store failed and the request was rejected
    FailClosed,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: DecisionReason,
    /// The matched rule's pattern
    pub rule: Option<String>,
    /// Physical key that was counted
    pub key: Option<String>,
    /// Entries in the window before this request
    pub count: Option<u64>,
    /// Limit applied to the counted shard
    pub limit: Option<u64>,
    /// Store failure behind a fail-open or fail-closed decision
    pub error: Option<RetryError>,
}

impl Decision {
    fn unmatched() -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::NoRule,
            rule: None,
            key: None,
            count: None,
            limit: None,
            error: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }
}

/// Decides, per request path, whether a request fits in the shared budget.
pub struct AdmissionController {
    rules: RuleTable,
    shards: ShardSelector,
    store: Arc<dyn WindowStore>,
    retry: RetryPolicy,
    ids: Arc<dyn IdSource>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    key_prefix: String,
    protocol_error: FailMode,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("rules", &self.rules.len())
            .field("shards", &self.shards.shard_count())
            .field("retry", &self.retry)
            .field("key_prefix", &self.key_prefix)
            .field("protocol_error", &self.protocol_error)
            .finish()
    }
}

impl AdmissionController {
    /// Start building a controller around a rule table and a store.
    pub fn builder(rules: RuleTable, store: Arc<dyn WindowStore>) -> AdmissionControllerBuilder {
        AdmissionControllerBuilder::new(rules, store)
    }

    /// Build a controller from validated configuration and a connected store.
    pub fn from_config(config: &FlowGuardConfig, store: Arc<dyn WindowStore>) -> Result<Self> {
        let ids: Arc<dyn IdSource> = match config.limiter.node_id {
            Some(node) => Arc::new(SnowflakeIds::new(node).ok_or_else(|| {
                FlowGuardError::Config("node_id must be in 0..=1023".into())
            })?),
            None => Arc::new(SnowflakeIds::with_random_node()),
        };
        let metrics: Arc<dyn MetricsSink> = match HttpReporter::from_config(&config.metrics)? {
            Some(reporter) => Arc::new(reporter),
            None => Arc::new(NoopSink),
        };

        Ok(Self::builder(config.rule_table()?, store)
            .shard_count(config.limiter.shard_count)
            .retry_policy(config.limiter.retry_policy())
            .key_prefix(config.limiter.key_prefix.clone())
            .protocol_error(config.limiter.protocol_error)
            .id_source(ids)
            .metrics(metrics)
            .build())
    }

    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Check a request against the shared budget.
    ///
    /// With `caller` set, the caller gets its own budget under the matched rule.
    /// Blocks for at most `max_attempts x attempt_timeout`.
    pub async fn is_allowed(&self, path: &str, caller: Option<&str>) -> Decision {
        self.check(path, caller, None).await
    }

    /// Like [`is_allowed`](Self::is_allowed), but no store attempt outlives `deadline`.
    pub async fn is_allowed_within(
        &self,
        path: &str,
        caller: Option<&str>,
        deadline: Instant,
    ) -> Decision {
        self.check(path, caller, Some(deadline)).await
    }

    async fn check(&self, path: &str, caller: Option<&str>, deadline: Option<Instant>) -> Decision {
        let Some(rule) = self.rules.resolve(path) else {
            trace!(path = %path, "No rule matches, admitting");
            return Decision::unmatched();
        };

        // one id per request: it picks the shard and tells same-millisecond entries apart
        let id = self.ids.next_id();
        let logical = logical_key(&self.key_prefix, rule, caller);
        let key = self.shards.shard_key(&logical, id);
        let limit = self.shards.per_shard_limit(rule.limit);

        let request =
            WindowRequest::new(key.clone(), rule.window_duration(), self.clock.now_millis(), id);

        let result = self
            .retry
            .execute(deadline, || self.store.count_and_insert(&request))
            .await;

        let decision = self.decide(path, rule, key, limit, result);
        self.metrics.record_decision(&rule.path, decision.allowed);
        decision
    }

    fn decide(
        &self,
        path: &str,
        rule: &Rule,
        key: String,
        limit: u64,
        result: std::result::Result<u64, RetryError>,
    ) -> Decision {
        let mut decision = Decision {
            allowed: true,
            reason: DecisionReason::WithinLimit,
            rule: Some(rule.path.clone()),
            key: Some(key),
            count: None,
            limit: Some(limit),
            error: None,
        };

        match result {
            Ok(count) => {
                decision.count = Some(count);
                if count >= limit {
                    decision.allowed = false;
                    decision.reason = DecisionReason::OverLimit;
                }
                debug!(
                    path = %path,
                    rule = %rule.path,
                    count = count,
                    limit = limit,
                    allowed = decision.allowed,
                    "Admission decision"
                );
            }
            Err(err) => {
                let deny = err.store_error().is_protocol() && self.protocol_error == FailMode::Deny;
                if deny {
                    decision.allowed = false;
                    decision.reason = DecisionReason::FailClosed;
                } else {
                    decision.reason = DecisionReason::FailOpen;
                }
                warn!(
                    path = %path,
                    rule = %rule.path,
                    attempts = err.attempts(),
                    error = %err,
                    allowed = decision.allowed,
                    "Store failure, falling back"
                );
                decision.error = Some(err);
            }
        }

        decision
    }
}

/// Builder for [`AdmissionController`]; every collaborator has a working default.
pub struct AdmissionControllerBuilder {
    rules: RuleTable,
    store: Arc<dyn WindowStore>,
    shard_count: u32,
    retry: RetryPolicy,
    ids: Option<Arc<dyn IdSource>>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    key_prefix: String,
    protocol_error: FailMode,
}

impl AdmissionControllerBuilder {
    fn new(rules: RuleTable, store: Arc<dyn WindowStore>) -> Self {
        Self {
            rules,
            store,
            shard_count: 1,
            retry: RetryPolicy::default(),
            ids: None,
            clock: Arc::new(SystemClock),
            metrics: Arc::new(NoopSink),
            key_prefix: "flow_guard:".to_string(),
            protocol_error: FailMode::default(),
        }
    }

    pub fn shard_count(mut self, shard_count: u32) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn id_source(mut self, ids: Arc<dyn IdSource>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn protocol_error(mut self, mode: FailMode) -> Self {
        self.protocol_error = mode;
        self
    }

    pub fn build(self) -> AdmissionController {
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(SnowflakeIds::with_random_node()));

        AdmissionController {
            rules: self.rules,
            shards: ShardSelector::new(self.shard_count),
            store: self.store,
            retry: self.retry,
            ids,
            clock: self.clock,
            metrics: self.metrics,
            key_prefix: self.key_prefix,
            protocol_error: self.protocol_error,
        }
    }
}
