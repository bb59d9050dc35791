use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Method;
use serde_json::Value;

use super::{REQUEST_ID_HEADER, StageClient, StageEndpoint, StageError, with_correlation};
use crate::request::StageName;

const MAX_ERROR_BODY_CHARS: usize = 512;

/// How a 2xx response body becomes a `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFormat {
    Json,
    /// Health bodies are opaque detail; plain text is kept as a string.
    JsonOrText,
}

/// Stage client speaking JSON over HTTP.
///
/// Work calls and health probes carry separate timeouts; a request that
/// exceeds its timeout surfaces as [`StageError::Timeout`].
#[derive(Debug, Clone)]
pub struct HttpStageClient {
    endpoint: StageEndpoint,
    client: reqwest::Client,
    call_timeout: Duration,
    health_timeout: Duration,
}

impl HttpStageClient {
    pub fn new(
        endpoint: StageEndpoint,
        client: reqwest::Client,
        call_timeout: Duration,
        health_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            client,
            call_timeout,
            health_timeout,
        }
    }

    pub fn endpoint(&self) -> &StageEndpoint {
        &self.endpoint
    }

    async fn route_one(
        &self,
        method: Method,
        api_path: &str,
        request_id: Option<&str>,
        body: Option<&Value>,
        timeout: Duration,
        format: BodyFormat,
    ) -> Result<Value, StageError> {
        let url = self.endpoint.api_path(api_path);
        let mut builder = self.client.request(method, &url).timeout(timeout);
        if let Some(request_id) = request_id {
            builder = builder.header(REQUEST_ID_HEADER, request_id);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| classify(&url, timeout, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StageError::Status {
                url,
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        let bytes = resp.bytes().await.map_err(|e| classify(&url, timeout, e))?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        decode_body(&url, &bytes, format)
    }
}

fn decode_body(url: &str, bytes: &[u8], format: BodyFormat) -> Result<Value, StageError> {
    match serde_json::from_slice(bytes) {
        Ok(value) => Ok(value),
        Err(_) if format == BodyFormat::JsonOrText => {
            Ok(Value::String(String::from_utf8_lossy(bytes).trim().to_string()))
        }
        Err(e) => Err(StageError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn classify(url: &str, timeout: Duration, err: reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::Timeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    } else if err.is_decode() {
        StageError::Decode {
            url: url.to_string(),
            reason: err.to_string(),
        }
    } else {
        StageError::Connection {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

#[async_trait]
impl StageClient for HttpStageClient {
    fn name(&self) -> StageName {
        self.endpoint.stage
    }

    async fn call(&self, request_id: &str, body: &Value) -> Result<Value, StageError> {
        debug!("[{}] Calling {} at {}", request_id, self.endpoint.stage, self.endpoint.url);
        let payload = with_correlation(body, request_id);
        self.route_one(
            Method::POST,
            self.endpoint.call_path,
            Some(request_id),
            Some(&payload),
            self.call_timeout,
            BodyFormat::Json,
        )
        .await
    }

    async fn health(&self) -> Result<Value, StageError> {
        self.route_one(
            Method::GET,
            self.endpoint.health_path,
            None,
            None,
            self.health_timeout,
            BodyFormat::JsonOrText,
        )
        .await
    }
}
