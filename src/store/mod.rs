//! Request store
//!
//! The store is the single source of truth for request records and the
//! bounded audit buffers. Every component receives it as
//! `Arc<dyn RequestStore>`; nothing keeps a private copy of a record.
//!
//! Backends:
//! - [`MemoryStore`]: process-local, DashMap keyed by request id
//! - [`RedisStore`]: shared Redis instance, optimistic per-key CAS

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::Value;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    request::{LogEntry, LogKind, Request, StageName, StageOutcome},
};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Maximum number of entries kept in each audit buffer.
pub const LOG_CAPACITY: usize = 100;

pub fn request_key(id: &str) -> String {
    format!("request:{}", id)
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Create a queued request with every stage pending.
    async fn create(&self, id: &str, input: Value) -> GatewayResult<Request>;

    async fn get(&self, id: &str) -> GatewayResult<Request>;

    /// Atomically apply one stage outcome to the request `id` and return the
    /// updated record.
    async fn update_stage(
        &self,
        id: &str,
        stage: StageName,
        outcome: StageOutcome,
    ) -> GatewayResult<Request>;

    /// Push onto the front of a bounded buffer, evicting the oldest entry
    /// beyond [`LOG_CAPACITY`].
    async fn append_log(&self, kind: LogKind, entry: LogEntry) -> GatewayResult<()>;

    /// Buffer contents, newest first.
    async fn logs(&self, kind: LogKind) -> GatewayResult<Vec<LogEntry>>;

    async fn health_check(&self) -> GatewayResult<()>;

    fn backend_name(&self) -> &'static str;
}

/// Build the store selected by the configuration.
pub fn create_store(config: &GatewayConfig) -> GatewayResult<Arc<dyn RequestStore>> {
    match &config.redis_url {
        Some(url) => {
            info!("Using redis request store at {}", url);
            let store = RedisStore::new(url, config.redis_pool_max)?;
            Ok(Arc::new(store))
        }
        None => {
            info!("Using in-memory request store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> GatewayResult<String> {
    serde_json::to_string(value).map_err(GatewayError::store)
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> GatewayResult<T> {
    serde_json::from_str(raw).map_err(GatewayError::store)
}
