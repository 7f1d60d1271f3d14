//! Redis-backed window store.
//!
//! The sliding-window step runs as a Lua script, so Redis executes eviction, count,
//! insert and expiry as one unit no matter how many instances call it at once. Single
//! nodes go through a `ConnectionManager` (reconnects on its own); clusters go through
//! the async cluster client, which routes the script by its single key.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{IntoConnectionInfo, Script, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{StoreConfig, StoreMode};
use crate::error::{FlowGuardError, Result, StoreError};
use crate::ratelimit::{WindowRequest, WindowStore, SLIDING_WINDOW_SCRIPT};

#[derive(Clone)]
enum Connection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Window store talking to a Redis node or cluster.
#[derive(Clone)]
pub struct RedisStore {
    connection: Connection,
    script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.connection {
            Connection::Single(_) => "single",
            Connection::Cluster(_) => "cluster",
        };
        f.debug_struct("RedisStore").field("mode", &mode).finish()
    }
}

impl RedisStore {
    /// Connect according to the store configuration.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let connection = match config.mode {
            StoreMode::Single => Self::connect_single(config).await?,
            StoreMode::Cluster => Self::connect_cluster(config).await?,
            StoreMode::Memory => {
                return Err(FlowGuardError::Config(
                    "memory mode does not use a Redis connection".into(),
                ))
            }
        };

        Ok(Self {
            connection,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }

    async fn connect_single(config: &StoreConfig) -> Result<Connection> {
        let address = config
            .addresses
            .first()
            .ok_or_else(|| FlowGuardError::Config("no store address configured".into()))?;

        let mut info = address
            .as_str()
            .into_connection_info()
            .map_err(|e| FlowGuardError::Config(format!("invalid store address: {}", e)))?;
        if config.password.is_some() {
            info.redis.password = config.password.clone();
        }
        info.redis.db = config.database;

        info!(address = %address, db = config.database, "Connecting to Redis");

        let client = redis::Client::open(info)
            .map_err(|e| FlowGuardError::Config(format!("invalid store address: {}", e)))?;
        let manager = with_timeout(config.connect_timeout(), ConnectionManager::new(client)).await?;

        info!("Connected to Redis");
        Ok(Connection::Single(manager))
    }

    async fn connect_cluster(config: &StoreConfig) -> Result<Connection> {
        info!(nodes = ?config.addresses, "Connecting to Redis cluster");

        let mut builder = ClusterClientBuilder::new(config.addresses.clone());
        if let Some(password) = &config.password {
            builder = builder.password(password.clone());
        }
        let client = builder
            .build()
            .map_err(|e| FlowGuardError::Config(format!("invalid cluster addresses: {}", e)))?;
        let connection = with_timeout(config.connect_timeout(), client.get_async_connection()).await?;

        info!("Connected to Redis cluster");
        Ok(Connection::Cluster(connection))
    }
}

async fn with_timeout<T, F>(timeout: Duration, connect: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => result.map_err(|e| FlowGuardError::Store(e.into())),
        Err(_) => Err(FlowGuardError::Store(StoreError::Timeout(format!(
            "connect did not finish within {:?}",
            timeout
        )))),
    }
}

/// Decode the script's reply: the pre-insert cardinality as an integer.
fn decode_count(value: Value) -> std::result::Result<u64, StoreError> {
    match value {
        Value::Int(count) if count >= 0 => Ok(count as u64),
        other => Err(StoreError::UnexpectedResponse(format!(
            "expected a non-negative integer, got {:?}",
            other
        ))),
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn count_and_insert(&self, request: &WindowRequest) -> std::result::Result<u64, StoreError> {
        let mut invocation = self.script.key(&request.key);
        invocation
            .arg(request.cutoff_ms())
            .arg(request.now_ms)
            .arg(&request.member)
            .arg(request.ttl_secs);

        let value: Value = match &self.connection {
            Connection::Single(manager) => {
                let mut conn = manager.clone();
                invocation.invoke_async(&mut conn).await?
            }
            Connection::Cluster(cluster) => {
                let mut conn = cluster.clone();
                invocation.invoke_async(&mut conn).await?
            }
        };

        let count = decode_count(value)?;
        debug!(key = %request.key, count = count, "Sliding window counted");
        Ok(count)
    }

    async fn ping(&self) -> std::result::Result<(), StoreError> {
        let cmd = redis::cmd("PING");
        let _: String = match &self.connection {
            Connection::Single(manager) => {
                let mut conn = manager.clone();
                cmd.query_async(&mut conn).await?
            }
            Connection::Cluster(cluster) => {
                let mut conn = cluster.clone();
                cmd.query_async(&mut conn).await?
            }
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_count() {
        assert_eq!(decode_count(Value::Int(4)).unwrap(), 4);
        assert!(decode_count(Value::Int(-1)).unwrap_err().is_protocol());
        assert!(decode_count(Value::Nil).unwrap_err().is_protocol());
        assert!(decode_count(Value::Okay).unwrap_err().is_protocol());
    }

    #[tokio::test]
    async fn test_memory_mode_rejected() {
        let config = StoreConfig {
            mode: StoreMode::Memory,
            ..StoreConfig::default()
        };
        assert!(matches!(
            RedisStore::connect(&config).await,
            Err(FlowGuardError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_to_connect() {
        let config = StoreConfig {
            addresses: vec!["redis://127.0.0.1:1".to_string()],
            connect_timeout_ms: 500,
            ..StoreConfig::default()
        };
        assert!(RedisStore::connect(&config).await.is_err());
    }

    /// Needs a Redis server: `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_sliding_window_against_redis() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        let config = StoreConfig {
            addresses: vec![url],
            ..StoreConfig::default()
        };
        let store = RedisStore::connect(&config).await.unwrap();
        store.ping().await.unwrap();

        let key = format!("flow_guard:test:{}", uuid::Uuid::new_v4());
        let window = Duration::from_secs(10);
        let now = chrono::Utc::now().timestamp_millis();

        for i in 0..3 {
            let req = WindowRequest::new(&key, window, now + i, i as u64);
            assert_eq!(store.count_and_insert(&req).await.unwrap(), i as u64);
        }

        // beyond the window, earlier entries are evicted before counting
        let req = WindowRequest::new(&key, window, now + 20_000, 99);
        assert_eq!(store.count_and_insert(&req).await.unwrap(), 0);
    }
}
