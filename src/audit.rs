//! Best-effort audit trail.
//!
//! Appends go to the bounded buffers owned by the store. A failed append is
//! logged and dropped; it never reaches the caller.

use std::sync::Arc;

use chrono::Utc;
use log::warn;

use crate::{
    request::{LogEntry, LogKind, Outcome},
    store::RequestStore,
};

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn RequestStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        kind: LogKind,
        request_id: &str,
        outcome: Outcome,
        processing_time_ms: i64,
    ) {
        let entry = LogEntry {
            request_id: request_id.to_string(),
            timestamp: Utc::now(),
            outcome,
            processing_time_ms,
        };
        if let Err(e) = self.store.append_log(kind, entry).await {
            warn!(
                "[{}] Failed to append to {}: {}",
                request_id,
                kind.key(),
                e
            );
        }
    }
}
