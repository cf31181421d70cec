use crate::core::domain::JobPayload;

#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub payload: JobPayload,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

/// Consumer side of a named job queue.
#[mockall::automock]
#[async_trait::async_trait]
pub trait JobQueue: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Waits for the next delivery. `None` once the queue is closed and drained.
    async fn dequeue(&self) -> Option<Delivery>;

    async fn ack(&self, delivery: &Delivery);

    /// Reports a failed delivery; `redeliver` lets the queue's retry policy
    /// schedule it again.
    async fn nack(&self, delivery: Delivery, redeliver: bool);
}
