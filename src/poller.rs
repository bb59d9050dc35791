//! Bounded wait for a request to reach a terminal state.
//!
//! The poller reads the store once per interval and holds nothing between
//! reads. It is a plain future: dropping it (for example when the HTTP client
//! disconnects) stops the reads and leaves the orchestration untouched.

use std::{sync::Arc, time::Duration};

use log::{debug, warn};
use serde_json::Value;
use tokio::time::{Instant, sleep, timeout};

use crate::{
    error::GatewayResult,
    request::{RequestStatus, StageName},
    store::RequestStore,
};

/// Lower bound on the poll cadence so a misconfigured interval cannot spin.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Completed {
        result: Value,
    },
    Failed {
        error: String,
        failed_stage: Option<StageName>,
    },
    /// The deadline passed first; look the request up by id later.
    StillProcessing,
}

#[derive(Clone)]
pub struct LifecyclePoller {
    store: Arc<dyn RequestStore>,
}

impl LifecyclePoller {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// Poll `id` every `poll_interval` until it is terminal or `deadline` has
    /// elapsed. Returns within `deadline` plus one interval, even when a store
    /// read hangs.
    pub async fn await_completion(
        &self,
        id: &str,
        deadline: Duration,
        poll_interval: Duration,
    ) -> GatewayResult<PollOutcome> {
        let interval = poll_interval.max(MIN_POLL_INTERVAL);
        let started = Instant::now();
        let mut polls: u32 = 0;

        loop {
            let budget = deadline.saturating_sub(started.elapsed()) + interval;
            let request = match timeout(budget, self.store.get(id)).await {
                Ok(read) => read?,
                Err(_) => {
                    warn!(
                        "[{}] Store read did not finish within {:?}, giving up wait",
                        id, budget
                    );
                    return Ok(PollOutcome::StillProcessing);
                }
            };
            polls += 1;

            match request.status {
                RequestStatus::Completed => {
                    return Ok(PollOutcome::Completed {
                        result: request.result.unwrap_or(Value::Null),
                    });
                }
                RequestStatus::Failed => {
                    return Ok(PollOutcome::Failed {
                        error: request.error.unwrap_or_default(),
                        failed_stage: request.failed_stage,
                    });
                }
                RequestStatus::Queued | RequestStatus::Processing => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                debug!(
                    "[{}] Still {} after {:?} ({} polls)",
                    id, request.status, elapsed, polls
                );
                return Ok(PollOutcome::StillProcessing);
            }
            sleep(interval.min(deadline - elapsed)).await;
        }
    }
}
