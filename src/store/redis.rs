//! Redis-backed request store
//!
//! Layout:
//! - `request:{id}`: JSON-encoded [`Request`]
//! - `inference_logs`, `processing_logs`: lists, newest entry at the head,
//!   trimmed to [`LOG_CAPACITY`] on every push
//!
//! `update_stage` is an optimistic compare-and-set: read the record,
//! transition it locally, then write it back with a script that only replaces
//! the value if it still equals what was read. On a lost race the loop retries
//! against the fresh value. Every command is self-contained, so an error or a
//! dropped future never returns a pooled connection carrying session state.

use async_trait::async_trait;
use chrono::Utc;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use log::{debug, warn};
use redis::AsyncCommands;
use serde_json::Value;

use super::{LOG_CAPACITY, RequestStore, decode, encode, request_key};
use crate::{
    error::{GatewayError, GatewayResult},
    request::{LogEntry, LogKind, Request, StageName, StageOutcome},
};

const MAX_CAS_ATTEMPTS: usize = 16;

/// KEYS[1] = record key, ARGV[1] = value read, ARGV[2] = replacement.
const COMPARE_AND_SET: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
end
return 0
";

pub struct RedisStore {
    pool: Pool,
    compare_and_set: redis::Script,
}

impl RedisStore {
    pub fn new(url: &str, pool_max: usize) -> GatewayResult<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(pool_max));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(GatewayError::store)?;
        Ok(Self {
            pool,
            compare_and_set: redis::Script::new(COMPARE_AND_SET),
        })
    }

    async fn conn(&self) -> GatewayResult<Connection> {
        Ok(self.pool.get().await?)
    }
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            compare_and_set: self.compare_and_set.clone(),
        }
    }
}

#[async_trait]
impl RequestStore for RedisStore {
    async fn create(&self, id: &str, input: Value) -> GatewayResult<Request> {
        let request = Request::new(id, input);
        let encoded = encode(&request)?;
        let mut conn = self.conn().await?;

        let created: Option<String> = redis::cmd("SET")
            .arg(request_key(id))
            .arg(encoded)
            .arg("NX")
            .query_async(&mut conn)
            .await?;

        match created {
            Some(_) => Ok(request),
            None => Err(GatewayError::AlreadyExists { id: id.to_string() }),
        }
    }

    async fn get(&self, id: &str) -> GatewayResult<Request> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(request_key(id)).await?;
        match raw {
            Some(raw) => decode(&raw),
            None => Err(GatewayError::NotFound { id: id.to_string() }),
        }
    }

    async fn update_stage(
        &self,
        id: &str,
        stage: StageName,
        outcome: StageOutcome,
    ) -> GatewayResult<Request> {
        let key = request_key(id);
        let mut conn = self.conn().await?;

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let raw: Option<String> = conn.get(&key).await?;
            let Some(raw) = raw else {
                return Err(GatewayError::NotFound { id: id.to_string() });
            };

            let mut request: Request = decode(&raw)?;
            request.apply(stage, outcome.clone(), Utc::now())?;

            let swapped: i64 = self
                .compare_and_set
                .key(&key)
                .arg(&raw)
                .arg(encode(&request)?)
                .invoke_async(&mut conn)
                .await?;

            if swapped == 1 {
                return Ok(request);
            }
            debug!(
                "[{}] Concurrent update on {}, retrying (attempt {})",
                id,
                stage,
                attempt + 1
            );
        }

        warn!("[{}] Gave up updating {} after {} attempts", id, stage, MAX_CAS_ATTEMPTS);
        Err(GatewayError::store(format!(
            "update of {} kept conflicting after {} attempts",
            key, MAX_CAS_ATTEMPTS
        )))
    }

    async fn append_log(&self, kind: LogKind, entry: LogEntry) -> GatewayResult<()> {
        let encoded = encode(&entry)?;
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .lpush(kind.key(), encoded)
            .ignore()
            .ltrim(kind.key(), 0, LOG_CAPACITY as isize - 1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn logs(&self, kind: LogKind) -> GatewayResult<Vec<LogEntry>> {
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn.lrange(kind.key(), 0, -1).await?;
        Ok(raw
            .iter()
            .filter_map(|item| match decode::<LogEntry>(item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Skipping malformed entry in {}: {}", kind.key(), e);
                    None
                }
            })
            .collect())
    }

    async fn health_check(&self) -> GatewayResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
