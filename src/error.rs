//! Error types for the pipeline gateway
//!
//! `GatewayError` is the taxonomy shared by the store, the orchestrator and the
//! HTTP layer. Stage transport failures are classified separately by
//! [`StageError`](crate::stage::StageError) and folded into
//! `GatewayError::UpstreamFailure` once the failing stage is known.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::request::StageName;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Request not found: {id}")]
    NotFound { id: String },

    #[error("Request already exists: {id}")]
    AlreadyExists { id: String },

    #[error("Invalid transition for request {id}: {reason}")]
    InvalidTransition { id: String, reason: String },

    #[error("Stage {stage} failed at {at}: {message}")]
    UpstreamFailure {
        stage: StageName,
        message: String,
        at: DateTime<Utc>,
    },

    #[error("Store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("Job queue full: {pending} jobs pending (capacity: {capacity})")]
    QueueFull { pending: usize, capacity: usize },

    #[error("Job queue is shutting down")]
    QueueClosed,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn upstream(stage: StageName, message: impl Into<String>) -> Self {
        GatewayError::UpstreamFailure {
            stage,
            message: message.into(),
            at: Utc::now(),
        }
    }

    pub fn store(reason: impl ToString) -> Self {
        GatewayError::StoreUnavailable {
            reason: reason.to_string(),
        }
    }

    pub fn invalid_transition(id: &str, reason: impl Into<String>) -> Self {
        GatewayError::InvalidTransition {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Stage the error is attributed to, if any.
    pub fn failed_stage(&self) -> Option<StageName> {
        match self {
            GatewayError::UpstreamFailure { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<redis::RedisError> for GatewayError {
    fn from(err: redis::RedisError) -> Self {
        GatewayError::store(err)
    }
}

impl From<deadpool_redis::PoolError> for GatewayError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        GatewayError::store(err)
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::AlreadyExists { .. } | GatewayError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            GatewayError::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::StoreUnavailable { .. }
            | GatewayError::QueueFull { .. }
            | GatewayError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut body = json!({
            "error": self.to_string(),
            "code": self.status_code().as_u16(),
        });
        match self {
            GatewayError::NotFound { id } => {
                body["request_id"] = json!(id);
            }
            GatewayError::UpstreamFailure { stage, at, .. } => {
                body["failed_stage"] = json!(stage);
                body["timestamp"] = json!(at.to_rfc3339());
            }
            _ => {}
        }
        HttpResponse::build(self.status_code()).json(body)
    }
}
