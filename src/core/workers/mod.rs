//! Queue consumers driving the sandbox.
//!
//! Both workers share one loop: a semaphore caps in-flight jobs, a token
//! bucket caps the dequeue rate, and every delivery is acked or nacked with
//! an explicit redelivery decision.

pub mod execution;
pub mod grading;
pub mod rate_limit;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;

use crate::{
    config::WorkerConfig,
    core::{
        domain::{JobPayload, JobUpdate},
        traits::{
            executor::SandboxError,
            queue::{Delivery, JobQueue},
            store::{ResultStore, StoreError},
        },
        workers::rate_limit::TokenBucket,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct JobFailure {
    pub message: String,
    pub redeliver: bool,
}

impl JobFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            redeliver: true,
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            redeliver: false,
        }
    }
}

impl From<StoreError> for JobFailure {
    fn from(e: StoreError) -> Self {
        JobFailure::retryable(e.to_string())
    }
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait JobHandler: std::fmt::Debug + Send + Sync {
    async fn handle(&self, payload: &JobPayload) -> Result<(), JobFailure>;
}

/// Consumes `queue` until `token` is cancelled or the queue closes, then
/// waits for in-flight jobs.
#[tracing::instrument(skip_all, fields(queue = %config.queue))]
pub async fn run_worker(
    config: WorkerConfig,
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    token: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let limiter = TokenBucket::new(config.rate_per_sec);
    let mut in_flight = JoinSet::new();
    tracing::info!(
        concurrency = config.concurrency,
        rate_per_sec = config.rate_per_sec,
        "Worker started"
    );

    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        tokio::select! {
            _ = token.cancelled() => break,
            _ = limiter.acquire() => {}
        }
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            delivery = queue.dequeue() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let queue = queue.clone();
        let handler = handler.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            process_delivery(queue.as_ref(), handler.as_ref(), delivery).await;
        });
        while in_flight.try_join_next().is_some() {}
    }

    tracing::info!(in_flight = in_flight.len(), "Worker draining");
    while in_flight.join_next().await.is_some() {}
    tracing::info!("Worker stopped");
}

async fn process_delivery(queue: &dyn JobQueue, handler: &dyn JobHandler, delivery: Delivery) {
    let job_id = delivery.payload.job_id().to_string();
    tracing::debug!(job_id = %job_id, attempt = delivery.attempt, "Job received");

    let outcome = AssertUnwindSafe(async { handler.handle(&delivery.payload).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(JobFailure::retryable("job handler panicked")));

    match outcome {
        Ok(()) => {
            tracing::debug!(job_id = %job_id, "Job done");
            queue.ack(&delivery).await;
        }
        Err(failure) => {
            tracing::warn!(
                job_id = %job_id,
                attempt = delivery.attempt,
                redeliver = failure.redeliver,
                "Job failed: {}",
                failure
            );
            queue.nack(delivery, failure.redeliver).await;
        }
    }
}

/// Marks the job `processing`. Returns `false` when an earlier delivery
/// already completed it.
pub(crate) async fn begin(
    store: &dyn ResultStore,
    job_id: &str,
    user_id: &str,
) -> Result<bool, JobFailure> {
    if let Some(record) = store.get(job_id).await?
        && record.status == crate::core::domain::JobStatus::Completed
    {
        tracing::info!(job_id, "Job already completed, skipping redelivery");
        return Ok(false);
    }

    store.upsert(job_id, user_id, JobUpdate::Processing).await?;
    Ok(true)
}

/// Persists an infrastructure failure and turns it into a retryable outcome.
pub(crate) async fn fail(
    store: &dyn ResultStore,
    job_id: &str,
    user_id: &str,
    error: SandboxError,
) -> Result<(), JobFailure> {
    let message = error.to_string();
    let update = JobUpdate::Failed {
        error: message.clone(),
    };
    if let Err(e) = store.upsert(job_id, user_id, update).await {
        tracing::error!(job_id, "Failed to persist job failure: {}", e);
    }
    Err(JobFailure::retryable(message))
}
