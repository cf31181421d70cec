use std::time::Duration;

pub const POOL_SIZE: usize = 10;
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub const BUNDLE_TIMEOUT: Duration = Duration::from_secs(30);

pub const MEMORY_LIMIT_MB: u64 = 128;
pub const CPU_LIMIT: f64 = 0.5;
pub const PIDS_LIMIT: u32 = 64;
pub const SCRATCH_SIZE_MB: u64 = 64;

pub const SANDBOX_IMAGE: &str = "codelearn-sandbox:latest";
pub const SANDBOX_IMAGE_CONTEXT: &str = "sandbox";
pub const SANDBOX_USER: &str = "1000:1000";
pub const SANDBOX_UID: &str = "1000";
pub const SCRATCH_DIR: &str = "/sandbox";
pub const POOL_LABEL: &str = "codelearn.sandbox.pool";

pub const STDOUT_LIMIT_BYTES: usize = 8 * 1024 * 1024;
pub const STDERR_LIMIT_BYTES: usize = 1024 * 1024;
pub const BUNDLE_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Seconds the in-container `timeout` wrapper waits past the host deadline.
pub const KILL_GRACE_SECS: u64 = 2;

pub const RESULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const EXECUTION_QUEUE: &str = "execution";
pub const GRADING_QUEUE: &str = "grading";
pub const EXECUTION_CONCURRENCY: usize = 5;
pub const EXECUTION_RATE_PER_SEC: u32 = 10;
pub const GRADING_CONCURRENCY: usize = 3;
pub const GRADING_RATE_PER_SEC: u32 = 5;
pub const MAX_DELIVERY_ATTEMPTS: u32 = 3;

pub const TIMEOUT_MSG_PREFIX: &str = "Execution timed out after";
