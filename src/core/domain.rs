use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ExecutionRequest {
    pub code: String,
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, stdin: Option<String>) -> Self {
        Self {
            code: code.into(),
            stdin: stdin.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PygameBundle {
    pub html: String,
    pub wasm: String,
    pub data: String,
    pub js: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub status: ExecutionStatus,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plots: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pygame_bundle: Option<PygameBundle>,
    /// Set when an interactive program could not be bundled and was run directly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_fallback: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub is_hidden: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionJob {
    pub job_id: String,
    #[serde(default)]
    pub user_id: String,
    pub code: String,
    #[serde(default)]
    pub input: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingJob {
    pub job_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub problem_id: String,
    pub code: String,
    pub test_cases: Vec<TestCase>,
}

/// A job as it travels on one of the two queues.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "queue", rename_all = "lowercase")]
pub enum JobPayload {
    Execution(ExecutionJob),
    Grading(GradingJob),
}

impl JobPayload {
    pub fn job_id(&self) -> &str {
        match self {
            JobPayload::Execution(job) => &job.job_id,
            JobPayload::Grading(job) => &job.job_id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            JobPayload::Execution(job) => &job.user_id,
            JobPayload::Grading(job) => &job.user_id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub index: usize,
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub passed: bool,
    pub status: ExecutionStatus,
    pub stderr: String,
    pub execution_time_ms: u64,
    pub is_hidden: bool,
    pub weight: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
    pub pass_rate: f64,
    pub score: f64,
    pub test_results: Vec<TestCaseResult>,
}

impl SubmissionResult {
    pub fn from_cases(test_results: Vec<TestCaseResult>) -> Self {
        let total = test_results.len();
        let passed = test_results.iter().filter(|r| r.passed).count();
        let total_weight: u32 = test_results.iter().map(|r| r.weight).sum();
        let passed_weight: u32 = test_results
            .iter()
            .filter(|r| r.passed)
            .map(|r| r.weight)
            .sum();

        Self {
            passed,
            failed: total - passed,
            total,
            pass_rate: percentage(passed as f64, total as f64),
            score: percentage(passed_weight as f64, total_weight as f64),
            test_results,
        }
    }
}

fn percentage(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        0.0
    } else {
        part / whole * 100.0
    }
}

/// Result-store document, keyed by job id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub user_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_result: Option<SubmissionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
}

impl JobRecord {
    pub fn pending(job_id: &str, user_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            user_id: user_id.to_string(),
            status: JobStatus::Pending,
            result: None,
            submission_result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            attempts: 0,
        }
    }

    /// Applies a lifecycle transition. Returns a new record, the old one is untouched.
    pub fn apply(&self, update: JobUpdate) -> Self {
        let mut next = self.clone();
        match update {
            JobUpdate::Processing => {
                next.status = JobStatus::Processing;
                next.error = None;
                next.completed_at = None;
                next.attempts += 1;
            }
            JobUpdate::Executed(result) => {
                next.status = JobStatus::Completed;
                next.result = Some(result);
                next.completed_at = Some(Utc::now());
            }
            JobUpdate::Graded(submission) => {
                next.status = JobStatus::Completed;
                next.submission_result = Some(submission);
                next.completed_at = Some(Utc::now());
            }
            JobUpdate::Failed { error } => {
                next.status = JobStatus::Failed;
                next.error = Some(error);
                next.completed_at = Some(Utc::now());
            }
        }
        next
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobUpdate {
    Processing,
    Executed(ExecutionResult),
    Graded(SubmissionResult),
    Failed { error: String },
}
