//! Client-facing gateway operations, independent of transport.
//!
//! `GatewayState` owns the store, the two stage clients and everything built
//! on them. The HTTP layer holds one instance and maps each route onto one
//! method here.

use std::{sync::Arc, time::Duration, time::Instant};

use log::{info, warn};
use serde_json::{Map, Value, json};

use crate::{
    audit::AuditLogger,
    config::GatewayConfig,
    error::{GatewayError, GatewayResult},
    health::{HealthAggregator, HealthReport},
    pipeline::PipelineOrchestrator,
    poller::{LifecyclePoller, PollOutcome},
    queue::JobQueue,
    rate_limit::RateLimiter,
    request::{
        LogEntry, LogKind, Outcome, Request, RequestView, StageName, StageOutcome,
        generate_request_id,
    },
    stage::{HttpStageClient, StageClient, StageEndpoint},
    store::{RequestStore, create_store},
};

pub const GATEWAY_NAME: &str = "api-gateway";

#[derive(Clone)]
pub struct GatewayState {
    store: Arc<dyn RequestStore>,
    processing: Arc<dyn StageClient>,
    inference: Arc<dyn StageClient>,
    queue: Arc<JobQueue>,
    poller: LifecyclePoller,
    health: HealthAggregator,
    audit: AuditLogger,
    rate_limiter: Arc<RateLimiter>,
    poll_deadline: Duration,
    poll_interval: Duration,
    pub log_interval: u64,
}

impl std::fmt::Debug for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayState")
            .field("store", &self.store.backend_name())
            .field("queue", &self.queue)
            .field("poll_deadline", &self.poll_deadline)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl GatewayState {
    /// Build the state with HTTP stage clients and the configured store.
    /// Spawns the job dispatcher, so it must run inside a tokio runtime.
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        let store = create_store(config)?;

        let processing = HttpStageClient::new(
            StageEndpoint::processing(config.processing_url.clone()),
            client.clone(),
            config.stage_timeout(),
            config.health_timeout(),
        );
        let inference = HttpStageClient::new(
            StageEndpoint::inference(config.inference_url.clone()),
            client,
            config.stage_timeout(),
            config.health_timeout(),
        );

        Ok(Self::with_parts(
            config,
            store,
            Arc::new(processing),
            Arc::new(inference),
        ))
    }

    pub fn with_parts(
        config: &GatewayConfig,
        store: Arc<dyn RequestStore>,
        processing: Arc<dyn StageClient>,
        inference: Arc<dyn StageClient>,
    ) -> Self {
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            processing.clone(),
            inference.clone(),
        ));
        let queue = JobQueue::new(config.job_queue_config(), orchestrator);

        Self {
            poller: LifecyclePoller::new(store.clone()),
            health: HealthAggregator::new(
                store.clone(),
                vec![processing.clone(), inference.clone()],
            ),
            audit: AuditLogger::new(store.clone()),
            rate_limiter: Arc::new(RateLimiter::new(
                config.rate_limit_max,
                config.rate_limit_window_secs,
            )),
            store,
            processing,
            inference,
            queue,
            poll_deadline: config.poll_deadline(),
            poll_interval: config.poll_interval(),
            log_interval: config.log_interval_secs,
        }
    }

    /// Create a queued request and hand it to the job queue.
    ///
    /// If the queue refuses it the request is marked failed at the
    /// processing stage so it does not linger as queued, and the failure is
    /// audited like any other terminal transition.
    pub async fn submit(&self, input: Value) -> GatewayResult<Request> {
        let id = generate_request_id();
        let request = self.store.create(&id, input).await?;
        info!("[{}] Request accepted", id);

        if let Err(e) = self.queue.submit(&id) {
            let message = format!("failed to queue request: {}", e);
            match self
                .store
                .update_stage(&id, StageName::Processing, StageOutcome::Failed(message))
                .await
            {
                Ok(failed) => {
                    self.audit
                        .record(
                            LogKind::Inference,
                            &id,
                            Outcome::Failed,
                            failed.processing_time_ms.unwrap_or(0),
                        )
                        .await;
                }
                Err(mark) => {
                    warn!("[{}] Could not mark rejected request failed: {}", id, mark);
                }
            }
            return Err(e);
        }
        Ok(request)
    }

    /// Submit and wait up to the configured deadline for a terminal state.
    pub async fn submit_and_wait(&self, input: Value) -> GatewayResult<(String, PollOutcome)> {
        let request = self.submit(input).await?;
        let outcome = self
            .poller
            .await_completion(&request.id, self.poll_deadline, self.poll_interval)
            .await?;
        Ok((request.id, outcome))
    }

    pub async fn status(&self, id: &str) -> GatewayResult<RequestView> {
        let request = self.store.get(id).await?;
        Ok(RequestView::from(&request))
    }

    pub async fn services_status(&self) -> HealthReport {
        self.health.aggregate().await
    }

    pub async fn store_health(&self) -> GatewayResult<()> {
        self.store.health_check().await
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    /// Send `body` straight to the processing stage.
    pub async fn forward_process(&self, body: Value) -> GatewayResult<Value> {
        self.forward(&self.processing, LogKind::Processing, body)
            .await
    }

    /// Send `body` straight to the inference stage.
    pub async fn forward_infer(&self, body: Value) -> GatewayResult<Value> {
        self.forward(&self.inference, LogKind::Inference, body)
            .await
    }

    async fn forward(
        &self,
        stage: &Arc<dyn StageClient>,
        kind: LogKind,
        body: Value,
    ) -> GatewayResult<Value> {
        let id = generate_request_id();
        let started = Instant::now();
        info!("[{}] Forwarding to {}", id, stage.name());

        let result = stage.call(&id, &body).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(response) => {
                self.audit
                    .record(kind, &id, Outcome::Completed, elapsed_ms)
                    .await;
                Ok(forwarded(response, &id))
            }
            Err(e) => {
                warn!("[{}] {} passthrough failed: {}", id, stage.name(), e);
                self.audit.record(kind, &id, Outcome::Failed, elapsed_ms).await;
                Err(GatewayError::upstream(stage.name(), e.to_string()))
            }
        }
    }

    pub async fn logs(&self, kind: LogKind) -> GatewayResult<Vec<LogEntry>> {
        self.store.logs(kind).await
    }

    /// Pending runs and free execution slots.
    pub fn queue_load(&self) -> (usize, usize) {
        self.queue.get_load_info()
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }
}

/// Tag a passthrough response with the gateway marker fields.
fn forwarded(response: Value, request_id: &str) -> Value {
    let mut body = match response {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    body.insert("gateway".to_string(), json!(GATEWAY_NAME));
    body.insert("forwarded".to_string(), json!(true));
    body.insert("request_id".to_string(), json!(request_id));
    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        request::RequestStatus,
        stage::StageError,
        store::MemoryStore,
    };

    struct EchoStage {
        name: StageName,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl StageClient for EchoStage {
        fn name(&self) -> StageName {
            self.name
        }

        async fn call(&self, _request_id: &str, body: &Value) -> Result<Value, StageError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(StageError::Status {
                    url: format!("http://{}/call", self.name),
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(json!({"stage": self.name.as_str(), "echo": body}))
        }

        async fn health(&self) -> Result<Value, StageError> {
            Ok(json!({"status": "healthy"}))
        }
    }

    fn stage(name: StageName, delay_ms: u64, fail: bool) -> Arc<dyn StageClient> {
        Arc::new(EchoStage {
            name,
            delay: Duration::from_millis(delay_ms),
            fail,
        })
    }

    fn state(store: Arc<MemoryStore>, delay_ms: u64, fail_inference: bool) -> GatewayState {
        let config = GatewayConfig {
            poll_deadline_ms: 300,
            poll_interval_ms: 20,
            stage_timeout_ms: 100,
            ..Default::default()
        };
        GatewayState::with_parts(
            &config,
            store,
            stage(StageName::Processing, delay_ms, false),
            stage(StageName::Inference, delay_ms, fail_inference),
        )
    }

    #[tokio::test]
    async fn test_submit_and_wait_completes() {
        let store = Arc::new(MemoryStore::new());
        let gateway = state(store.clone(), 0, false);

        let (id, outcome) = gateway.submit_and_wait(json!({"x": 1})).await.unwrap();
        let PollOutcome::Completed { result } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(result["stage"], "inference-stage");
        assert_eq!(result["echo"]["stage"], "processing-stage");

        let view = gateway.status(&id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_submit_and_wait_reports_failure() {
        let gateway = state(Arc::new(MemoryStore::new()), 0, true);

        let (_, outcome) = gateway.submit_and_wait(json!({"x": 1})).await.unwrap();
        assert!(matches!(
            outcome,
            PollOutcome::Failed {
                failed_stage: Some(StageName::Inference),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_submit_and_wait_deadline() {
        let store = Arc::new(MemoryStore::new());
        let gateway = state(store.clone(), 250, false);

        let (id, outcome) = gateway.submit_and_wait(json!({})).await.unwrap();
        assert_eq!(outcome, PollOutcome::StillProcessing);

        // The run keeps going after the wait gives up.
        let mut status = RequestStatus::Processing;
        for _ in 0..100 {
            status = store.get(&id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status, RequestStatus::Completed);
    }

    #[tokio::test]
    async fn test_queue_rejection_is_failed_and_audited() {
        let store = Arc::new(MemoryStore::new());
        let config = GatewayConfig {
            poll_deadline_ms: 300,
            poll_interval_ms: 20,
            stage_timeout_ms: 100,
            queue_capacity: 1,
            max_concurrent_jobs: 1,
            ..Default::default()
        };
        let gateway = GatewayState::with_parts(
            &config,
            store.clone(),
            stage(StageName::Processing, 5_000, false),
            stage(StageName::Inference, 0, false),
        );

        let mut rejection = None;
        for _ in 0..10 {
            match gateway.submit(json!({})).await {
                Ok(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(e) => {
                    rejection = Some(e);
                    break;
                }
            }
        }
        let err = rejection.expect("queue never filled");
        assert!(matches!(err, GatewayError::QueueFull { .. }));

        let logs = gateway.logs(LogKind::Inference).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, Outcome::Failed);

        let rejected = store.get(&logs[0].request_id).await.unwrap();
        assert_eq!(rejected.status, RequestStatus::Failed);
        assert_eq!(rejected.failed_stage, Some(StageName::Processing));
        assert!(rejected.error.as_deref().unwrap().contains("failed to queue"));
    }

    #[tokio::test]
    async fn test_status_of_unknown_id() {
        let gateway = state(Arc::new(MemoryStore::new()), 0, false);
        let err = gateway.status("req_0_missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_forward_process_tags_response_and_logs() {
        let store = Arc::new(MemoryStore::new());
        let gateway = state(store.clone(), 0, false);

        let response = gateway.forward_process(json!({"data": [1, 2]})).await.unwrap();
        assert_eq!(response["gateway"], GATEWAY_NAME);
        assert_eq!(response["forwarded"], true);
        assert_eq!(response["echo"]["data"], json!([1, 2]));

        let logs = gateway.logs(LogKind::Processing).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, Outcome::Completed);
        assert_eq!(logs[0].request_id, response["request_id"]);
        assert!(gateway.logs(LogKind::Inference).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forward_infer_failure_is_upstream() {
        let gateway = state(Arc::new(MemoryStore::new()), 0, true);

        let err = gateway.forward_infer(json!({"input": "x"})).await.unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageName::Inference));

        let logs = gateway.logs(LogKind::Inference).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, Outcome::Failed);
    }

    #[test]
    fn test_forwarded_wraps_non_objects() {
        let body = forwarded(json!([1, 2, 3]), "req_1");
        assert_eq!(body["data"], json!([1, 2, 3]));
        assert_eq!(body["forwarded"], true);
        assert_eq!(body["request_id"], "req_1");
    }
}
