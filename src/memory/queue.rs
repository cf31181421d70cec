use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::core::{
    domain::JobPayload,
    traits::queue::{Delivery, JobQueue},
};

const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// FIFO queue with at-least-once delivery and a bounded retry budget.
/// Redeliveries are scheduled with exponential backoff.
///
/// After `close`, consumers keep receiving until nothing is left: no queued
/// job, no delivery awaiting its ack or nack, no scheduled redelivery.
#[derive(Debug)]
pub struct InMemoryQueue {
    name: String,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<mpsc::UnboundedReceiver<Delivery>>,
    closed: CancellationToken,
    /// Deliveries handed out and not yet settled, plus pending redeliveries.
    outstanding: Arc<AtomicUsize>,
    settled: Arc<Notify>,
    max_attempts: u32,
    acked: AtomicUsize,
    dropped: AtomicUsize,
}

impl InMemoryQueue {
    pub fn new(name: impl Into<String>, max_attempts: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
            outstanding: Arc::new(AtomicUsize::new(0)),
            settled: Arc::new(Notify::new()),
            max_attempts: max_attempts.max(1),
            acked: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn enqueue(&self, payload: JobPayload) {
        if self.closed.is_cancelled() {
            tracing::warn!(
                queue = %self.name,
                job_id = payload.job_id(),
                "Queue closed, job rejected"
            );
            return;
        }
        if self.tx.send(Delivery { payload, attempt: 1 }).is_err() {
            tracing::warn!(queue = %self.name, "Queue receiver gone, job lost");
        }
    }

    /// Stops accepting new jobs. Redeliveries of jobs already taken are
    /// still honoured.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn settle(&self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.settled.notify_waiters();
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dequeue(&self) -> Option<Delivery> {
        let mut rx = self.rx.lock().await;
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            // Read the counter before polling the channel: a redelivery is
            // sent before it stops counting as outstanding.
            let closed = self.closed.is_cancelled();
            let drained = closed && self.outstanding.load(Ordering::SeqCst) == 0;
            let delivery = match rx.try_recv() {
                Ok(delivery) => Some(delivery),
                Err(_) if drained => return None,
                Err(_) => tokio::select! {
                    delivery = rx.recv() => delivery,
                    _ = self.closed.cancelled(), if !closed => None,
                    _ = &mut settled => None,
                },
            };

            if let Some(delivery) = delivery {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                return Some(delivery);
            }
        }
    }

    async fn ack(&self, _delivery: &Delivery) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        self.settle();
    }

    async fn nack(&self, delivery: Delivery, redeliver: bool) {
        let job_id = delivery.payload.job_id().to_string();
        if !redeliver || delivery.attempt >= self.max_attempts {
            tracing::warn!(
                queue = %self.name,
                job_id = %job_id,
                attempt = delivery.attempt,
                "Job dropped"
            );
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.settle();
            return;
        }

        let backoff = BASE_BACKOFF * 2u32.pow(delivery.attempt - 1);
        let tx = self.tx.clone();
        let outstanding = self.outstanding.clone();
        let settled = self.settled.clone();
        tracing::info!(
            queue = %self.name,
            job_id = %job_id,
            ?backoff,
            "Job scheduled for redelivery"
        );
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let redelivery = Delivery {
                payload: delivery.payload,
                attempt: delivery.attempt + 1,
            };
            if tx.send(redelivery).is_err() {
                tracing::warn!(job_id = %job_id, "Queue receiver gone, redelivery lost");
            }
            outstanding.fetch_sub(1, Ordering::SeqCst);
            settled.notify_waiters();
        });
    }
}
