use crate::core::{
    domain::{ExecutionRequest, ExecutionResult},
    traits::runtime::RuntimeError,
};

/// Failures of the machinery around a run. Timeouts and crashes of the
/// submitted program are not errors; they come back as an `ExecutionResult`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("provisioning failed: {0}")]
    Provisioning(RuntimeError),

    #[error("infrastructure failure: {0}")]
    Infrastructure(#[from] RuntimeError),

    #[error("staging failed: {msg}")]
    Staging { msg: String },
}

#[mockall::automock]
#[async_trait::async_trait]
pub trait CodeExecutor: std::fmt::Debug + Send + Sync {
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError>;
}
