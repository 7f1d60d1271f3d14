//! Shared store backends for the sliding window.
//!
//! Redis is the store the fleet shares; the in-memory store mirrors its semantics for
//! single-process runs and tests.

mod memory;
mod redis;

use std::sync::Arc;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::config::{StoreConfig, StoreMode};
use crate::error::Result;
use crate::ratelimit::WindowStore;

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn WindowStore>> {
    match config.mode {
        StoreMode::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreMode::Single | StoreMode::Cluster => Ok(Arc::new(RedisStore::connect(config).await?)),
    }
}
