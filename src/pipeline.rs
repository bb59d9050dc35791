//! Pipeline orchestration
//!
//! Drives a single request through `processing-stage -> inference-stage`.
//! Stages run strictly in order with no retries; the inference stage consumes
//! whatever the processing stage returned. Every outcome is written to the
//! store before the next step begins, so a run never leaves its request in a
//! non-terminal state unless the store itself is gone.

use std::sync::Arc;

use log::{error, info, warn};
use serde_json::Value;

use crate::{
    audit::AuditLogger,
    error::{GatewayError, GatewayResult},
    request::{LogKind, Outcome, Request, StageName, StageOutcome},
    stage::StageClient,
    store::RequestStore,
};

pub struct PipelineOrchestrator {
    store: Arc<dyn RequestStore>,
    processing: Arc<dyn StageClient>,
    inference: Arc<dyn StageClient>,
    audit: AuditLogger,
}

impl PipelineOrchestrator {
    pub fn new(
        store: Arc<dyn RequestStore>,
        processing: Arc<dyn StageClient>,
        inference: Arc<dyn StageClient>,
    ) -> Self {
        let audit = AuditLogger::new(store.clone());
        Self {
            store,
            processing,
            inference,
            audit,
        }
    }

    /// Run request `id` to a terminal state and return the final result.
    ///
    /// A stage failure comes back as `UpstreamFailure` naming the stage; the
    /// same failure is already recorded on the request. An audit entry is
    /// written only by the update that moves the request to a terminal status.
    pub async fn run(&self, id: &str) -> GatewayResult<Value> {
        let request = match self.store.get(id).await {
            Ok(request) => request,
            Err(GatewayError::StoreUnavailable { reason }) => {
                return Err(self.store_lost(id, StageName::Processing, &reason).await);
            }
            Err(e) => return Err(e),
        };

        let stages: [(StageName, &Arc<dyn StageClient>); 2] = [
            (StageName::Processing, &self.processing),
            (StageName::Inference, &self.inference),
        ];

        let mut payload = request.input;
        for (stage, client) in stages {
            self.record(id, stage, StageOutcome::Started).await?;

            match client.call(id, &payload).await {
                Ok(output) => {
                    info!("[{}] {} done", id, stage);
                    self.record(id, stage, StageOutcome::Done(output.clone()))
                        .await?;
                    payload = output;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!("[{}] {} failed: {}", id, stage, message);
                    self.record(id, stage, StageOutcome::Failed(message.clone()))
                        .await?;
                    return Err(GatewayError::upstream(stage, message));
                }
            }
        }

        Ok(payload)
    }

    /// Write one stage outcome, converting a lost store into a failure of
    /// that stage.
    async fn record(
        &self,
        id: &str,
        stage: StageName,
        outcome: StageOutcome,
    ) -> GatewayResult<Request> {
        match self.store.update_stage(id, stage, outcome).await {
            Ok(request) => {
                self.audit_terminal(&request).await;
                Ok(request)
            }
            Err(GatewayError::StoreUnavailable { reason }) => {
                Err(self.store_lost(id, stage, &reason).await)
            }
            Err(e) => {
                error!("[{}] Rejected update for {}: {}", id, stage, e);
                Err(e)
            }
        }
    }

    async fn store_lost(&self, id: &str, stage: StageName, reason: &str) -> GatewayError {
        let message = format!("store unavailable during {}: {}", stage, reason);
        error!("[{}] {}", id, message);

        // Best effort: the store may already be back.
        match self
            .store
            .update_stage(id, stage, StageOutcome::Failed(message.clone()))
            .await
        {
            Ok(request) => self.audit_terminal(&request).await,
            Err(e) => warn!("[{}] Could not mark request failed: {}", id, e),
        }
        GatewayError::upstream(stage, message)
    }

    /// Updates to a terminal request are rejected, so a terminal result here
    /// means this update made the transition.
    async fn audit_terminal(&self, request: &Request) {
        if !request.is_terminal() {
            return;
        }
        self.audit
            .record(
                LogKind::Inference,
                &request.id,
                Outcome::from(request.status),
                request.processing_time_ms.unwrap_or(0),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        request::{LogEntry, RequestStatus, StageStatus},
        stage::StageError,
        store::MemoryStore,
    };

    struct ScriptedStage {
        name: StageName,
        response: Result<Value, StageError>,
        calls: AtomicUsize,
        bodies: Mutex<Vec<Value>>,
    }

    impl ScriptedStage {
        fn new(name: StageName, response: Result<Value, StageError>) -> Arc<Self> {
            Arc::new(Self {
                name,
                response,
                calls: AtomicUsize::new(0),
                bodies: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StageClient for ScriptedStage {
        fn name(&self) -> StageName {
            self.name
        }

        async fn call(&self, _request_id: &str, body: &Value) -> Result<Value, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bodies.lock().push(body.clone());
            self.response.clone()
        }

        async fn health(&self) -> Result<Value, StageError> {
            Ok(json!({"status": "healthy"}))
        }
    }

    /// Memory store whose next `Done` write fails as if the connection dropped.
    struct FlakyStore {
        inner: MemoryStore,
        fail_next_done: AtomicBool,
    }

    #[async_trait]
    impl RequestStore for FlakyStore {
        async fn create(&self, id: &str, input: Value) -> GatewayResult<Request> {
            self.inner.create(id, input).await
        }
        async fn get(&self, id: &str) -> GatewayResult<Request> {
            self.inner.get(id).await
        }
        async fn update_stage(
            &self,
            id: &str,
            stage: StageName,
            outcome: StageOutcome,
        ) -> GatewayResult<Request> {
            if matches!(outcome, StageOutcome::Done(_))
                && self.fail_next_done.swap(false, Ordering::SeqCst)
            {
                return Err(GatewayError::store("connection reset by peer"));
            }
            self.inner.update_stage(id, stage, outcome).await
        }
        async fn append_log(&self, kind: LogKind, entry: LogEntry) -> GatewayResult<()> {
            self.inner.append_log(kind, entry).await
        }
        async fn logs(&self, kind: LogKind) -> GatewayResult<Vec<LogEntry>> {
            self.inner.logs(kind).await
        }
        async fn health_check(&self) -> GatewayResult<()> {
            Ok(())
        }
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    fn timeout_error() -> StageError {
        StageError::Timeout {
            url: "http://data-processor:3002/process".to_string(),
            timeout_ms: 10_000,
        }
    }

    #[tokio::test]
    async fn test_successful_run_completes_request() {
        let store = Arc::new(MemoryStore::new());
        let processing = ScriptedStage::new(StageName::Processing, Ok(json!({"y": 2})));
        let inference = ScriptedStage::new(
            StageName::Inference,
            Ok(json!({"prediction": "A", "confidence": 0.9})),
        );
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), processing.clone(), inference.clone());

        store.create("req_ok", json!({"x": 1})).await.unwrap();
        let result = orchestrator.run("req_ok").await.unwrap();
        assert_eq!(result["prediction"], "A");

        assert_eq!(processing.bodies.lock().as_slice(), &[json!({"x": 1})]);
        assert_eq!(inference.bodies.lock().as_slice(), &[json!({"y": 2})]);

        let request = store.get("req_ok").await.unwrap();
        assert_eq!(request.status, RequestStatus::Completed);
        assert_eq!(request.result.as_ref().unwrap()["prediction"], "A");
        assert_eq!(request.intermediate, Some(json!({"y": 2})));
        assert_eq!(request.stage(StageName::Processing), StageStatus::Done);
        assert_eq!(request.stage(StageName::Inference), StageStatus::Done);
        assert!(request.completed_at.is_some());

        let logs = store.logs(LogKind::Inference).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_processing_timeout_skips_inference() {
        let store = Arc::new(MemoryStore::new());
        let processing = ScriptedStage::new(StageName::Processing, Err(timeout_error()));
        let inference = ScriptedStage::new(StageName::Inference, Ok(json!({})));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), processing.clone(), inference.clone());

        store.create("req_timeout", json!({"x": 1})).await.unwrap();
        let err = orchestrator.run("req_timeout").await.unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageName::Processing));
        assert!(err.to_string().contains("timed out"));

        assert_eq!(processing.calls(), 1);
        assert_eq!(inference.calls(), 0);

        let request = store.get("req_timeout").await.unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.failed_stage, Some(StageName::Processing));
        assert_eq!(request.stage(StageName::Inference), StageStatus::Pending);
        assert!(request.failed_at.is_some());

        let logs = store.logs(LogKind::Inference).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn test_inference_failure_leaves_no_result() {
        let store = Arc::new(MemoryStore::new());
        let processing = ScriptedStage::new(StageName::Processing, Ok(json!({"y": 2})));
        let inference = ScriptedStage::new(
            StageName::Inference,
            Err(StageError::Status {
                url: "http://inference-engine:3001/infer".to_string(),
                status: 500,
                body: "model not loaded".to_string(),
            }),
        );
        let orchestrator = PipelineOrchestrator::new(store.clone(), processing, inference);

        store.create("req_inf", json!({"x": 1})).await.unwrap();
        let err = orchestrator.run("req_inf").await.unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageName::Inference));

        let request = store.get("req_inf").await.unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.failed_stage, Some(StageName::Inference));
        assert!(request.result.is_none());
        assert!(request.error.as_deref().unwrap().contains("model not loaded"));
    }

    #[tokio::test]
    async fn test_unknown_request_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let processing = ScriptedStage::new(StageName::Processing, Ok(json!({})));
        let inference = ScriptedStage::new(StageName::Inference, Ok(json!({})));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), processing.clone(), inference);

        let err = orchestrator.run("req_missing").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound { .. }));
        assert_eq!(processing.calls(), 0);
        assert!(store.logs(LogKind::Inference).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_loss_marks_request_failed() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_next_done: AtomicBool::new(true),
        });
        let processing = ScriptedStage::new(StageName::Processing, Ok(json!({"y": 2})));
        let inference = ScriptedStage::new(StageName::Inference, Ok(json!({})));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), processing, inference.clone());

        store.create("req_flaky", json!({"x": 1})).await.unwrap();
        let err = orchestrator.run("req_flaky").await.unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageName::Processing));
        assert_eq!(inference.calls(), 0);

        let request = store.get("req_flaky").await.unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert!(request.error.as_deref().unwrap().contains("store unavailable"));

        let logs = store.logs(LogKind::Inference).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, Outcome::Failed);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let processing = ScriptedStage::new(StageName::Processing, Ok(json!({"y": 2})));
        let inference = ScriptedStage::new(StageName::Inference, Ok(json!({"prediction": "B"})));
        let orchestrator =
            PipelineOrchestrator::new(store.clone(), processing.clone(), inference);

        store.create("req_twice", json!({})).await.unwrap();
        orchestrator.run("req_twice").await.unwrap();
        let err = orchestrator.run("req_twice").await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidTransition { .. }));
        assert_eq!(processing.calls(), 1);

        let request = store.get("req_twice").await.unwrap();
        assert_eq!(request.status, RequestStatus::Completed);

        let logs = store.logs(LogKind::Inference).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].request_id, "req_twice");
        assert_eq!(logs[0].outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_failed_request_rerun_adds_no_entry() {
        let store = Arc::new(MemoryStore::new());
        let processing = ScriptedStage::new(StageName::Processing, Err(timeout_error()));
        let inference = ScriptedStage::new(StageName::Inference, Ok(json!({})));
        let orchestrator = PipelineOrchestrator::new(store.clone(), processing, inference);

        store.create("req_failed_twice", json!({})).await.unwrap();
        orchestrator.run("req_failed_twice").await.unwrap_err();
        orchestrator.run("req_failed_twice").await.unwrap_err();
        orchestrator.run("req_never_created").await.unwrap_err();

        let logs = store.logs(LogKind::Inference).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].request_id, "req_failed_twice");
        assert_eq!(logs[0].outcome, Outcome::Failed);
    }
}
