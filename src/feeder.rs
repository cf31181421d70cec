use std::sync::Arc;

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    core::domain::JobPayload,
    memory::{queue::InMemoryQueue, store::InMemoryResultStore},
};

/// Reads newline-delimited JSON jobs, seeds their `pending` records and
/// routes each to its queue. Both queues are closed at end of input.
pub fn feed_jobs<R>(
    reader: R,
    store: Arc<InMemoryResultStore>,
    execution: Arc<InMemoryQueue>,
    grading: Arc<InMemoryQueue>,
    token: CancellationToken,
) -> JoinHandle<usize>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = reader.lines();
        let mut accepted = 0;

        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("Failed to read job input: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let payload: JobPayload = match serde_json::from_str(&line) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Skipping malformed job: {}", e);
                    continue;
                }
            };

            store.create(payload.job_id(), payload.user_id());
            tracing::info!(job_id = payload.job_id(), "Job enqueued");
            match payload {
                JobPayload::Execution(_) => execution.enqueue(payload),
                JobPayload::Grading(_) => grading.enqueue(payload),
            }
            accepted += 1;
        }

        execution.close();
        grading.close();
        accepted
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        domain::JobStatus,
        traits::{queue::JobQueue, store::ResultStore},
    };

    #[tokio::test]
    async fn test_jobs_are_routed_by_queue() {
        let input = concat!(
            r#"{"queue":"execution","jobId":"e1","userId":"u","code":"print(1)"}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"queue":"grading","jobId":"g1","userId":"u","code":"print(1)","testCases":[]}"#,
            "\n",
        );
        let store = Arc::new(InMemoryResultStore::default());
        let execution = Arc::new(InMemoryQueue::new("execution", 1));
        let grading = Arc::new(InMemoryQueue::new("grading", 1));

        let accepted = feed_jobs(
            input.as_bytes(),
            store.clone(),
            execution.clone(),
            grading.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(accepted, 2);
        let delivery = execution.dequeue().await.unwrap();
        assert_eq!(delivery.payload.job_id(), "e1");
        execution.ack(&delivery).await;
        assert!(execution.dequeue().await.is_none());
        assert_eq!(grading.dequeue().await.unwrap().payload.job_id(), "g1");
        assert_eq!(
            store.get("g1").await.unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_end_of_input_releases_idle_consumers() {
        let input = r#"{"queue":"execution","jobId":"e1","code":"print(1)"}"#;
        let execution = Arc::new(InMemoryQueue::new("execution", 1));
        let grading = Arc::new(InMemoryQueue::new("grading", 1));
        let waiting = tokio::spawn({
            let grading = grading.clone();
            async move { grading.dequeue().await }
        });

        feed_jobs(
            input.as_bytes(),
            Arc::new(InMemoryResultStore::default()),
            execution,
            grading,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let delivery = tokio::time::timeout(std::time::Duration::from_secs(2), waiting)
            .await
            .expect("grading consumer should see the end of input")
            .unwrap();
        assert!(delivery.is_none());
    }
}
