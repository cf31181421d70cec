use std::sync::Arc;

use crate::core::{
    domain::{ExecutionRequest, JobPayload, JobUpdate},
    traits::{executor::CodeExecutor, store::ResultStore},
    workers::{JobFailure, JobHandler, begin, fail},
};

/// Runs a single submission once and stores its result.
#[derive(Debug, Clone)]
pub struct ExecutionHandler {
    executor: Arc<dyn CodeExecutor>,
    store: Arc<dyn ResultStore>,
}

impl ExecutionHandler {
    pub fn new(executor: Arc<dyn CodeExecutor>, store: Arc<dyn ResultStore>) -> Self {
        Self { executor, store }
    }
}

#[async_trait::async_trait]
impl JobHandler for ExecutionHandler {
    #[tracing::instrument(skip_all, fields(job_id = payload.job_id()))]
    async fn handle(&self, payload: &JobPayload) -> Result<(), JobFailure> {
        let JobPayload::Execution(job) = payload else {
            return Err(JobFailure::rejected("grading job on the execution queue"));
        };
        if !begin(self.store.as_ref(), &job.job_id, &job.user_id).await? {
            return Ok(());
        }

        let request = ExecutionRequest::new(job.code.clone(), job.input.clone());
        let result = match self.executor.execute(&request).await {
            Ok(result) => result,
            Err(e) => return fail(self.store.as_ref(), &job.job_id, &job.user_id, e).await,
        };

        tracing::info!(
            status = ?result.status,
            execution_time_ms = result.execution_time_ms,
            "Execution job completed"
        );
        self.store
            .upsert(&job.job_id, &job.user_id, JobUpdate::Executed(result))
            .await?;
        Ok(())
    }
}
