//! Service health aggregation
//!
//! Probes the store and every stage concurrently and folds the results into
//! one report. A failing probe only marks its own entry; it never aborts the
//! aggregation.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    stage::{StageClient, StageError},
    store::RequestStore,
};

pub const GATEWAY_SERVICE: &str = "gateway";
pub const STORE_SERVICE: &str = "store";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Connected,
    Degraded,
    Error,
    Unavailable,
}

impl ServiceStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, ServiceStatus::Healthy | ServiceStatus::Connected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub service_name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

impl ServiceSnapshot {
    fn ok(name: &str, status: ServiceStatus, detail: Value, latency_ms: Option<u64>) -> Self {
        Self {
            service_name: name.to_string(),
            status,
            detail: Some(detail),
            error: None,
            latency_ms,
        }
    }

    fn failed(name: &str, status: ServiceStatus, error: String, latency_ms: u64) -> Self {
        Self {
            service_name: name.to_string(),
            status,
            detail: None,
            error: Some(error),
            latency_ms: Some(latency_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub services: BTreeMap<String, ServiceSnapshot>,
    pub overall: OverallStatus,
}

impl HealthReport {
    pub fn from_snapshots(snapshots: Vec<ServiceSnapshot>) -> Self {
        let overall = if snapshots.iter().all(|s| s.status.is_ok()) {
            OverallStatus::Healthy
        } else {
            OverallStatus::Degraded
        };
        Self {
            timestamp: Utc::now(),
            services: snapshots
                .into_iter()
                .map(|s| (s.service_name.clone(), s))
                .collect(),
            overall,
        }
    }
}

#[derive(Clone)]
pub struct HealthAggregator {
    store: Arc<dyn RequestStore>,
    stages: Vec<Arc<dyn StageClient>>,
}

impl HealthAggregator {
    pub fn new(store: Arc<dyn RequestStore>, stages: Vec<Arc<dyn StageClient>>) -> Self {
        Self { store, stages }
    }

    pub async fn aggregate(&self) -> HealthReport {
        let stage_probes = join_all(self.stages.iter().map(|stage| Self::probe_stage(stage)));
        let (store_snapshot, stage_snapshots) =
            futures::join!(self.probe_store(), stage_probes);

        let mut snapshots = Vec::with_capacity(self.stages.len() + 2);
        snapshots.push(ServiceSnapshot::ok(
            GATEWAY_SERVICE,
            ServiceStatus::Healthy,
            json!({"service": "api-gateway"}),
            None,
        ));
        snapshots.push(store_snapshot);
        snapshots.extend(stage_snapshots);

        HealthReport::from_snapshots(snapshots)
    }

    async fn probe_store(&self) -> ServiceSnapshot {
        let start = Instant::now();
        let result = self.store.health_check().await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(()) => ServiceSnapshot::ok(
                STORE_SERVICE,
                ServiceStatus::Connected,
                json!({"backend": self.store.backend_name()}),
                Some(latency_ms),
            ),
            Err(e) => ServiceSnapshot::failed(
                STORE_SERVICE,
                ServiceStatus::Error,
                e.to_string(),
                latency_ms,
            ),
        }
    }

    async fn probe_stage(stage: &Arc<dyn StageClient>) -> ServiceSnapshot {
        let name = stage.name();
        let start = Instant::now();
        let result = stage.health().await;
        let latency_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(detail) => {
                // A stage may answer 2xx while reporting itself degraded.
                let status = match detail.get("status").and_then(Value::as_str) {
                    Some("degraded") => ServiceStatus::Degraded,
                    _ => ServiceStatus::Healthy,
                };
                ServiceSnapshot::ok(name.as_str(), status, detail, Some(latency_ms))
            }
            Err(e) => {
                // Unreachable is distinguished from reachable-but-failing.
                let status = match e {
                    StageError::Connection { .. } => ServiceStatus::Unavailable,
                    _ => ServiceStatus::Error,
                };
                ServiceSnapshot::failed(name.as_str(), status, e.to_string(), latency_ms)
            }
        }
    }
}
