use std::sync::Arc;

use crate::core::{
    domain::{ExecutionRequest, ExecutionResult},
    pool::SandboxPool,
    protocol::ExecutionProtocol,
    traits::executor::{CodeExecutor, SandboxError},
};

/// Leases a container per request, runs the protocol in it and hands the
/// container back, or tears it down when it can no longer be trusted.
#[derive(Debug, Clone)]
pub struct PooledExecutor {
    pool: Arc<SandboxPool>,
    protocol: Arc<ExecutionProtocol>,
}

impl PooledExecutor {
    pub fn new(pool: Arc<SandboxPool>, protocol: Arc<ExecutionProtocol>) -> Self {
        Self { pool, protocol }
    }
}

#[async_trait::async_trait]
impl CodeExecutor for PooledExecutor {
    #[tracing::instrument(skip(self, request))]
    async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let lease = self.pool.acquire().await?;
        let outcome = self.protocol.run(lease.id(), request).await;

        match outcome {
            Ok(outcome) if outcome.reusable => {
                self.pool.release(lease).await;
                tracing::debug!(status = ?outcome.result.status, "Execution finished");
                Ok(outcome.result)
            }
            Ok(outcome) => {
                self.pool.discard(lease).await;
                Ok(outcome.result)
            }
            Err(e) => {
                tracing::error!(container = %lease.id(), "Execution failed: {}", e);
                self.pool.discard(lease).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SandboxConfig,
        core::{
            domain::ExecutionStatus,
            pool::PoolStats,
            protocol::classifier::ImportClassifier,
            traits::runtime::{ExecOutput, MockSandboxRuntime, RuntimeError},
        },
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor<F>(program: F) -> (PooledExecutor, Arc<SandboxPool>)
    where
        F: Fn() -> Result<ExecOutput, RuntimeError> + Send + 'static,
    {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut runtime = MockSandboxRuntime::new();
        runtime.expect_image_exists().returning(|_| Ok(true));
        runtime
            .expect_create()
            .returning(move |_| Ok(format!("c{}", counter.fetch_add(1, Ordering::SeqCst))));
        runtime.expect_stop().returning(|_| Ok(()));
        runtime.expect_remove().returning(|_| Ok(()));
        runtime.expect_exec().returning(move |_, req| match req.args[0].as_str() {
            "timeout" => program(),
            "pgrep" => Ok(ExecOutput {
                stdout: "7\n".to_string(),
                exit_code: Some(0),
                ..ExecOutput::default()
            }),
            _ => Ok(ExecOutput {
                exit_code: Some(0),
                ..ExecOutput::default()
            }),
        });

        let runtime = Arc::new(runtime);
        let config = SandboxConfig {
            pool_size: 2,
            ..SandboxConfig::default()
        };
        let pool = Arc::new(SandboxPool::new(runtime.clone(), config.clone()));
        let protocol = Arc::new(ExecutionProtocol::new(
            runtime,
            Arc::new(ImportClassifier::default()),
            config,
        ));
        (PooledExecutor::new(pool.clone(), protocol), pool)
    }

    #[tokio::test]
    async fn test_container_returned_after_run() {
        let (executor, pool) = executor(|| {
            Ok(ExecOutput {
                stdout: "ok\n".to_string(),
                exit_code: Some(0),
                ..ExecOutput::default()
            })
        });

        let result = executor
            .execute(&ExecutionRequest::new("print('ok')", None))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(
            pool.stats(),
            PoolStats {
                phase: crate::core::pool::PoolPhase::Ready,
                tracked: 2,
                busy: 0,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unkillable_container_is_discarded() {
        let (executor, pool) = executor(|| {
            Ok(ExecOutput {
                timed_out: true,
                ..ExecOutput::default()
            })
        });

        let result = executor
            .execute(&ExecutionRequest::new("while True: pass", None))
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(pool.stats().tracked, 1);
        assert_eq!(pool.stats().busy, 0);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_discards_container() {
        let (executor, pool) =
            executor(|| Err(RuntimeError::Unavailable("daemon stopped".to_string())));

        let result = executor
            .execute(&ExecutionRequest::new("print(1)", None))
            .await;

        assert!(matches!(result, Err(SandboxError::Infrastructure(_))));
        assert_eq!(pool.stats().tracked, 1);
    }
}
