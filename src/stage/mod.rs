//! Backend stage clients
//!
//! The orchestrator and the health aggregator only see the [`StageClient`]
//! trait. [`HttpStageClient`] is the production implementation; tests plug
//! in scripted clients.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::request::StageName;

pub mod http;

pub use http::HttpStageClient;

/// Header carrying the correlation id on every stage call.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StageError {
    #[error("timed out after {timeout_ms}ms calling {url}")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    #[error("{url} returned HTTP {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

#[async_trait]
pub trait StageClient: Send + Sync {
    fn name(&self) -> StageName;

    /// Invoke the stage for `request_id` and return its JSON response.
    async fn call(&self, request_id: &str, body: &Value) -> Result<Value, StageError>;

    /// Probe the stage's health endpoint; the body is opaque detail.
    async fn health(&self) -> Result<Value, StageError>;
}

/// Where a stage lives and which path performs its work.
#[derive(Debug, Clone)]
pub struct StageEndpoint {
    pub stage: StageName,
    pub url: String,
    pub call_path: &'static str,
    pub health_path: &'static str,
}

impl StageEndpoint {
    pub fn processing(url: impl Into<String>) -> Self {
        StageEndpoint {
            stage: StageName::Processing,
            url: url.into(),
            call_path: "/process",
            health_path: "/health",
        }
    }

    pub fn inference(url: impl Into<String>) -> Self {
        StageEndpoint {
            stage: StageName::Inference,
            url: url.into(),
            call_path: "/infer",
            health_path: "/health",
        }
    }

    pub fn api_path(&self, api_path: &str) -> String {
        let base = self.url.trim_end_matches('/');
        if api_path.starts_with('/') {
            format!("{}{}", base, api_path)
        } else {
            format!("{}/{}", base, api_path)
        }
    }
}

/// Attach the correlation id to a stage request body.
///
/// Objects get a `request_id` field; any other JSON value is wrapped as
/// `{"data": value, "request_id": id}`.
pub fn with_correlation(body: &Value, request_id: &str) -> Value {
    match body {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("request_id".to_string(), json!(request_id));
            Value::Object(map)
        }
        other => json!({ "data": other, "request_id": request_id }),
    }
}
