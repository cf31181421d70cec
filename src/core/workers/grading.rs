use std::sync::Arc;

use futures::{StreamExt, stream::FuturesOrdered};
use itertools::Itertools;

use crate::core::{
    domain::{
        ExecutionRequest, ExecutionStatus, GradingJob, JobPayload, JobUpdate, SubmissionResult,
        TestCase, TestCaseResult,
    },
    traits::{
        executor::{CodeExecutor, SandboxError},
        store::ResultStore,
    },
    workers::{JobFailure, JobHandler, begin, fail},
};

/// Runs a submission once per test case, each in a freshly leased sandbox,
/// and stores the tally.
#[derive(Debug, Clone)]
pub struct GradingHandler {
    executor: Arc<dyn CodeExecutor>,
    store: Arc<dyn ResultStore>,
    parallelism: usize,
}

impl GradingHandler {
    pub fn new(executor: Arc<dyn CodeExecutor>, store: Arc<dyn ResultStore>) -> Self {
        Self {
            executor,
            store,
            parallelism: 1,
        }
    }

    /// Number of test cases of one job run at the same time.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    async fn grade(&self, job: &GradingJob) -> Result<SubmissionResult, SandboxError> {
        let mut running = FuturesOrdered::new();
        let mut cases = Vec::with_capacity(job.test_cases.len());

        for (index, case) in job.test_cases.iter().enumerate() {
            if running.len() >= self.parallelism
                && let Some(result) = running.next().await
            {
                cases.push(result?);
            }
            running.push_back(self.run_case(&job.code, index, case.clone()));
        }
        while let Some(result) = running.next().await {
            cases.push(result?);
        }

        Ok(SubmissionResult::from_cases(cases))
    }

    async fn run_case(
        &self,
        code: &str,
        index: usize,
        case: TestCase,
    ) -> Result<TestCaseResult, SandboxError> {
        let request = ExecutionRequest::new(code, Some(case.input.clone()));
        let result = self.executor.execute(&request).await?;
        let passed = result.status == ExecutionStatus::Success
            && outputs_match(&result.stdout, &case.expected_output);
        tracing::debug!(index, passed, status = ?result.status, "Test case graded");

        Ok(TestCaseResult {
            index,
            input: case.input,
            expected_output: case.expected_output,
            actual_output: result.stdout,
            passed,
            status: result.status,
            stderr: result.stderr,
            execution_time_ms: result.execution_time_ms,
            is_hidden: case.is_hidden,
            weight: case.weight,
        })
    }
}

#[async_trait::async_trait]
impl JobHandler for GradingHandler {
    #[tracing::instrument(skip_all, fields(job_id = payload.job_id()))]
    async fn handle(&self, payload: &JobPayload) -> Result<(), JobFailure> {
        let JobPayload::Grading(job) = payload else {
            return Err(JobFailure::rejected("execution job on the grading queue"));
        };
        if !begin(self.store.as_ref(), &job.job_id, &job.user_id).await? {
            return Ok(());
        }

        let submission = match self.grade(job).await {
            Ok(submission) => submission,
            Err(e) => return fail(self.store.as_ref(), &job.job_id, &job.user_id, e).await,
        };

        tracing::info!(
            problem_id = %job.problem_id,
            passed = submission.passed,
            total = submission.total,
            pass_rate = submission.pass_rate,
            "Grading job completed"
        );
        self.store
            .upsert(&job.job_id, &job.user_id, JobUpdate::Graded(submission))
            .await?;
        Ok(())
    }
}

/// Compares program output with the expected answer, ignoring trailing
/// whitespace on every line and blank lines around the output.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize(actual) == normalize(expected)
}

fn normalize(output: &str) -> String {
    output.trim().lines().map(str::trim_end).join("\n")
}
