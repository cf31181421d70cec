use crate::core::domain::{JobRecord, JobUpdate};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("result store unavailable: {0}")]
    Unavailable(String),
}

/// Narrow contract with the persistent result store: upsert by job id.
///
/// Records carry a retention TTL on the store side and may disappear at any
/// time, so `upsert` creates the record when it is missing.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ResultStore: std::fmt::Debug + Send + Sync {
    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    async fn upsert(
        &self,
        job_id: &str,
        user_id: &str,
        update: JobUpdate,
    ) -> Result<JobRecord, StoreError>;
}
