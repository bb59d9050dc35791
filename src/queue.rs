//! Background execution of pipeline runs
//!
//! Accepted request ids are pushed onto a bounded channel. A single dispatcher
//! task pulls them off and spawns one orchestration per id, with a semaphore
//! capping how many run at once. Runs are detached from the HTTP request that
//! submitted them.

use std::{sync::Arc, time::Instant};

use log::{debug, error, info, warn};
use tokio::sync::{
    OwnedSemaphorePermit, Semaphore,
    mpsc::{self, error::TrySendError},
};

use crate::{
    error::{GatewayError, GatewayResult},
    pipeline::PipelineOrchestrator,
};

/// Job queue configuration
#[derive(Clone, Debug)]
pub struct JobQueueConfig {
    /// Maximum pending runs waiting for a slot
    pub queue_capacity: usize,
    /// Maximum number of runs executing concurrently
    pub max_concurrent_jobs: usize,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            max_concurrent_jobs: 32,
        }
    }
}

pub struct JobQueue {
    tx: mpsc::Sender<String>,
    concurrency_limit: Arc<Semaphore>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (queue_depth, available_permits) = self.get_load_info();
        f.debug_struct("JobQueue")
            .field("queue_depth", &queue_depth)
            .field("available_permits", &available_permits)
            .finish()
    }
}

impl JobQueue {
    /// Create the queue and spawn its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(config: JobQueueConfig, orchestrator: Arc<PipelineOrchestrator>) -> Arc<Self> {
        let capacity = config.queue_capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<String>(capacity);

        debug!(
            "Initializing job queue: capacity={}, max_concurrent={}",
            capacity, config.max_concurrent_jobs
        );

        let concurrency_limit = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        let queue = Arc::new(Self {
            tx,
            concurrency_limit: concurrency_limit.clone(),
        });

        tokio::spawn(async move {
            while let Some(id) = rx.recv().await {
                let Ok(permit) = concurrency_limit.clone().acquire_owned().await else {
                    error!("Semaphore closed, stopping dispatcher");
                    break;
                };

                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    Self::process_job(id, orchestrator, permit).await;
                });
            }

            debug!("Job dispatcher stopped");
        });

        queue
    }

    /// Queue depth and free execution slots.
    pub fn get_load_info(&self) -> (usize, usize) {
        let queue_depth = self.tx.max_capacity() - self.tx.capacity();
        let available_permits = self.concurrency_limit.available_permits();
        (queue_depth, available_permits)
    }

    /// Hand `id` to the dispatcher without waiting for room.
    pub fn submit(&self, id: &str) -> GatewayResult<()> {
        match self.tx.try_send(id.to_string()) {
            Ok(()) => {
                let (queue_depth, available_permits) = self.get_load_info();
                debug!(
                    "[{}] Run queued: queue_depth={}, available_slots={}",
                    id, queue_depth, available_permits
                );
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let (queue_depth, _) = self.get_load_info();
                warn!("[{}] Job queue full, rejecting run", id);
                Err(GatewayError::QueueFull {
                    pending: queue_depth,
                    capacity: self.tx.max_capacity(),
                })
            }
            Err(TrySendError::Closed(_)) => Err(GatewayError::QueueClosed),
        }
    }

    async fn process_job(
        id: String,
        orchestrator: Arc<PipelineOrchestrator>,
        _permit: OwnedSemaphorePermit,
    ) {
        let start = Instant::now();
        match orchestrator.run(&id).await {
            Ok(_) => info!("[{}] Pipeline completed in {:?}", id, start.elapsed()),
            Err(e) => warn!("[{}] Pipeline ended in {:?}: {}", id, start.elapsed(), e),
        }
    }
}
