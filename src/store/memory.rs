use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use serde_json::Value;

use super::{LOG_CAPACITY, RequestStore};
use crate::{
    error::{GatewayError, GatewayResult},
    request::{LogEntry, LogKind, Request, StageName, StageOutcome},
};

/// In-process store.
///
/// Records live in a `DashMap`; `update_stage` mutates through `get_mut`, so
/// the lock held is the one guarding that key's shard and only for the
/// duration of the transition. Each audit buffer has its own mutex.
pub struct MemoryStore {
    requests: DashMap<String, Request>,
    logs: HashMap<LogKind, Mutex<VecDeque<LogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let logs = LogKind::ALL
            .iter()
            .map(|kind| (*kind, Mutex::new(VecDeque::with_capacity(LOG_CAPACITY + 1))))
            .collect();
        Self {
            requests: DashMap::new(),
            logs,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn buffer(&self, kind: LogKind) -> GatewayResult<&Mutex<VecDeque<LogEntry>>> {
        self.logs
            .get(&kind)
            .ok_or_else(|| GatewayError::store(format!("no buffer for {}", kind.key())))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn create(&self, id: &str, input: Value) -> GatewayResult<Request> {
        match self.requests.entry(id.to_string()) {
            Entry::Occupied(_) => Err(GatewayError::AlreadyExists { id: id.to_string() }),
            Entry::Vacant(slot) => {
                let request = Request::new(id, input);
                slot.insert(request.clone());
                Ok(request)
            }
        }
    }

    async fn get(&self, id: &str) -> GatewayResult<Request> {
        self.requests
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| GatewayError::NotFound { id: id.to_string() })
    }

    async fn update_stage(
        &self,
        id: &str,
        stage: StageName,
        outcome: StageOutcome,
    ) -> GatewayResult<Request> {
        let mut entry = self
            .requests
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound { id: id.to_string() })?;
        entry.apply(stage, outcome, Utc::now())?;
        Ok(entry.clone())
    }

    async fn append_log(&self, kind: LogKind, entry: LogEntry) -> GatewayResult<()> {
        let mut buffer = self.buffer(kind)?.lock();
        buffer.push_front(entry);
        buffer.truncate(LOG_CAPACITY);
        Ok(())
    }

    async fn logs(&self, kind: LogKind) -> GatewayResult<Vec<LogEntry>> {
        let buffer = self.buffer(kind)?.lock();
        Ok(buffer.iter().cloned().collect())
    }

    async fn health_check(&self) -> GatewayResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
