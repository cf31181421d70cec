use chrono::{TimeDelta, Utc};
use dashmap::DashMap;

use crate::{
    constants::RESULT_RETENTION,
    core::{
        domain::{JobRecord, JobUpdate},
        traits::store::{ResultStore, StoreError},
    },
};

/// Result store keeping records in memory with a retention window measured
/// from creation. Expired records behave as if they were never written.
#[derive(Debug)]
pub struct InMemoryResultStore {
    records: DashMap<String, JobRecord>,
    retention: TimeDelta,
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new(TimeDelta::from_std(RESULT_RETENTION).unwrap_or(TimeDelta::days(7)))
    }
}

impl InMemoryResultStore {
    pub fn new(retention: TimeDelta) -> Self {
        Self {
            records: DashMap::new(),
            retention,
        }
    }

    /// Seeds a `pending` record, the way a caller does when enqueueing.
    pub fn create(&self, job_id: &str, user_id: &str) {
        self.records
            .insert(job_id.to_string(), JobRecord::pending(job_id, user_id));
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !self.is_expired(record));
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            tracing::debug!(purged, "Expired job records purged");
        }
        purged
    }

    /// Live records ordered by creation time.
    pub fn records(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .records
            .iter()
            .filter(|r| !self.is_expired(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn is_expired(&self, record: &JobRecord) -> bool {
        Utc::now() - record.created_at > self.retention
    }
}

#[async_trait::async_trait]
impl ResultStore for InMemoryResultStore {
    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .records
            .get(job_id)
            .map(|r| r.clone())
            .filter(|r| !self.is_expired(r)))
    }

    async fn upsert(
        &self,
        job_id: &str,
        user_id: &str,
        update: JobUpdate,
    ) -> Result<JobRecord, StoreError> {
        let mut entry = self
            .records
            .entry(job_id.to_string())
            .or_insert_with(|| JobRecord::pending(job_id, user_id));
        if self.is_expired(&entry) {
            tracing::debug!(job_id, "Job record expired, starting over");
            *entry = JobRecord::pending(job_id, user_id);
        }
        let next = entry.apply(update);
        *entry = next.clone();
        Ok(next)
    }
}
