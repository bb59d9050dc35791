//! Request lifecycle model
//!
//! A [`Request`] moves through `queued -> processing -> completed | failed`.
//! Every mutation after creation goes through [`Request::apply`], which is the
//! single place the state machine is enforced. Store backends call it under
//! their per-key isolation so both backends accept exactly the same
//! transitions.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

/// Generate a request id of the form `req_<unix-millis>_<9 base36 chars>`.
pub fn generate_request_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("req_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StageName {
    #[serde(rename = "processing-stage")]
    Processing,
    #[serde(rename = "inference-stage")]
    Inference,
}

impl StageName {
    pub const PIPELINE: [StageName; 2] = [StageName::Processing, StageName::Inference];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Processing => "processing-stage",
            StageName::Inference => "inference-stage",
        }
    }

    /// The stage whose output resolves the whole request.
    pub fn is_final(&self) -> bool {
        matches!(self, StageName::Inference)
    }

    pub fn previous(&self) -> Option<StageName> {
        match self {
            StageName::Processing => None,
            StageName::Inference => Some(StageName::Processing),
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl StageStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, StageStatus::Done | StageStatus::Failed)
    }
}

/// Outcome reported for one stage of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Started,
    Done(Value),
    Failed(String),
}

impl StageOutcome {
    fn label(&self) -> &'static str {
        match self {
            StageOutcome::Started => "started",
            StageOutcome::Done(_) => "done",
            StageOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub status: RequestStatus,
    pub input: Value,
    pub stage_status: BTreeMap<StageName, StageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageName>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
}

impl Request {
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self::with_created_at(id, input, Utc::now())
    }

    pub fn with_created_at(id: impl Into<String>, input: Value, created_at: DateTime<Utc>) -> Self {
        let stage_status = StageName::PIPELINE
            .iter()
            .map(|stage| (*stage, StageStatus::Pending))
            .collect();
        Self {
            id: id.into(),
            status: RequestStatus::Queued,
            input,
            stage_status,
            intermediate: None,
            result: None,
            error: None,
            failed_stage: None,
            created_at,
            completed_at: None,
            failed_at: None,
            processing_time_ms: None,
        }
    }

    pub fn stage(&self, stage: StageName) -> StageStatus {
        self.stage_status
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at.or(self.failed_at)
    }

    /// Apply one stage outcome at time `now`.
    ///
    /// Rejects any change to a terminal request, any backwards stage move,
    /// and any update to a stage whose predecessor is not done. On error the
    /// request is left untouched.
    pub fn apply(
        &mut self,
        stage: StageName,
        outcome: StageOutcome,
        now: DateTime<Utc>,
    ) -> GatewayResult<()> {
        if self.status.is_terminal() {
            return Err(GatewayError::invalid_transition(
                &self.id,
                format!("request is already {}", self.status),
            ));
        }

        if let Some(previous) = stage.previous() {
            if self.stage(previous) != StageStatus::Done {
                return Err(GatewayError::invalid_transition(
                    &self.id,
                    format!("{} is not done, cannot update {}", previous, stage),
                ));
            }
        }

        let current = self.stage(stage);
        let allowed = match &outcome {
            StageOutcome::Started => current == StageStatus::Pending,
            StageOutcome::Done(_) | StageOutcome::Failed(_) => !current.is_finished(),
        };
        if !allowed {
            return Err(GatewayError::invalid_transition(
                &self.id,
                format!("{} cannot move from {:?} to {}", stage, current, outcome.label()),
            ));
        }

        match outcome {
            StageOutcome::Started => {
                self.stage_status.insert(stage, StageStatus::InProgress);
                self.status = RequestStatus::Processing;
            }
            StageOutcome::Done(data) => {
                self.stage_status.insert(stage, StageStatus::Done);
                if stage.is_final() {
                    self.status = RequestStatus::Completed;
                    self.result = Some(data);
                    self.completed_at = Some(now);
                    self.processing_time_ms = Some(self.elapsed_ms(now));
                } else {
                    self.status = RequestStatus::Processing;
                    self.intermediate = Some(data);
                }
            }
            StageOutcome::Failed(error) => {
                self.stage_status.insert(stage, StageStatus::Failed);
                self.status = RequestStatus::Failed;
                self.error = Some(error);
                self.failed_stage = Some(stage);
                self.failed_at = Some(now);
                self.processing_time_ms = Some(self.elapsed_ms(now));
            }
        }
        Ok(())
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_milliseconds().max(0)
    }
}

/// Client-facing view of a request, as returned by status lookup.
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    pub request_id: String,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageName>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    pub pipeline: BTreeMap<StageName, StageStatus>,
}

impl From<&Request> for RequestView {
    fn from(request: &Request) -> Self {
        Self {
            request_id: request.id.clone(),
            status: request.status,
            created_at: request.created_at,
            result: request.result.clone(),
            completed_at: request.completed_at,
            error: request.error.clone(),
            failed_stage: request.failed_stage,
            failed_at: request.failed_at,
            processing_time_ms: request.processing_time_ms,
            pipeline: request.stage_status.clone(),
        }
    }
}

/// Which bounded audit buffer an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogKind {
    Inference,
    Processing,
}

impl LogKind {
    pub const ALL: [LogKind; 2] = [LogKind::Inference, LogKind::Processing];

    /// Key of the list holding this buffer.
    pub fn key(&self) -> &'static str {
        match self {
            LogKind::Inference => "inference_logs",
            LogKind::Processing => "processing_logs",
        }
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inference" | "inference_logs" => Ok(LogKind::Inference),
            "processing" | "processing_logs" => Ok(LogKind::Processing),
            other => Err(format!("unknown log kind: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
}

impl From<RequestStatus> for Outcome {
    fn from(status: RequestStatus) -> Self {
        match status {
            RequestStatus::Completed => Outcome::Completed,
            _ => Outcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
    pub processing_time_ms: i64,
}
