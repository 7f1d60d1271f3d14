//! Configuration management for Flow Guard.
//!
//! Configuration is read once at startup from a YAML file, with environment overrides
//! of the form `FLOW_GUARD__LIMITER__SHARD_COUNT=4`. There is no hot reload.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FlowGuardError, Result};
use crate::ratelimit::{RetryPolicy, Rule, RuleTable};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "FLOW_GUARD";

/// Main configuration for Flow Guard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowGuardConfig {
    /// Shared store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behavior
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Path rules
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Decision reporting
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// How the store is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// One Redis node
    #[default]
    Single,
    /// Redis cluster, seeded from every listed address
    Cluster,
    /// In-process store, for local runs and tests
    Memory,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub mode: StoreMode,

    /// `redis://` URLs; single mode uses the first one
    #[serde(default = "default_addresses")]
    pub addresses: Vec<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Logical database, single mode only
    #[serde(default)]
    pub database: i64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            addresses: default_addresses(),
            password: None,
            database: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_addresses() -> Vec<String> {
    vec!["redis://127.0.0.1:6379".to_string()]
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

/// What to do when the store answers with something the limiter cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    /// Admit the request and surface the error
    #[default]
    Allow,
    /// Reject the request and surface the error
    Deny,
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Prefix for every key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Physical keys per logical key
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Total attempts per decision
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Reaction to undecodable store replies
    #[serde(default)]
    pub protocol_error: FailMode,

    /// Node id for the snowflake id source; random when unset
    #[serde(default)]
    pub node_id: Option<u16>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            shard_count: default_shard_count(),
            max_attempts: default_max_attempts(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            protocol_error: FailMode::default(),
            node_id: None,
        }
    }
}

impl LimiterConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.attempt_timeout_ms),
        )
    }
}

fn default_key_prefix() -> String {
    "flow_guard:".to_string()
}

fn default_shard_count() -> u32 {
    1
}

fn default_max_attempts() -> usize {
    3
}

fn default_attempt_timeout_ms() -> u64 {
    1000
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Decision reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// URL that receives the JSON report
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub app_id: String,

    #[serde(default)]
    pub token: String,

    #[serde(default = "default_metrics_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            app_id: String::new(),
            token: String::new(),
            timeout_ms: default_metrics_timeout_ms(),
        }
    }
}

fn default_metrics_timeout_ms() -> u64 {
    5000
}

impl FlowGuardConfig {
    /// Load configuration from a file, applying environment overrides, and validate it.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(FlowGuardError::Config(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }

        let config: FlowGuardConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FlowGuardError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FlowGuardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FlowGuardError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the limiter cannot serve.
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            rule.validate()?;
        }

        if self.limiter.shard_count == 0 {
            return Err(FlowGuardError::Config("shard_count must be at least 1".into()));
        }
        if self.limiter.max_attempts == 0 {
            return Err(FlowGuardError::Config("max_attempts must be at least 1".into()));
        }
        if self.limiter.attempt_timeout_ms == 0 {
            return Err(FlowGuardError::Config("attempt_timeout_ms must be positive".into()));
        }
        if matches!(self.limiter.node_id, Some(id) if id > 1023) {
            return Err(FlowGuardError::Config("node_id must be in 0..=1023".into()));
        }

        if self.store.mode != StoreMode::Memory && self.store.addresses.is_empty() {
            return Err(FlowGuardError::Config(
                "store addresses are required outside memory mode".into(),
            ));
        }

        if self.metrics.enabled && self.metrics.endpoint.is_none() {
            return Err(FlowGuardError::Config(
                "metrics endpoint is required when metrics are enabled".into(),
            ));
        }

        Ok(())
    }

    /// The validated rule table.
    pub fn rule_table(&self) -> Result<RuleTable> {
        RuleTable::new(self.rules.clone())
    }
}
