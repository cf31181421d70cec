use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::constants::*;
use crate::core::traits::runtime::ContainerSpec;

/// Process-wide sandbox settings. Built once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct SandboxConfig {
    pub pool_size: usize,
    pub idle_timeout: Duration,
    pub execution_timeout: Duration,
    pub cleanup_interval: Duration,
    pub bundle_timeout: Duration,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub scratch_size_mb: u64,
    pub image: String,
    pub image_context: PathBuf,
    pub user: String,
    pub uid: String,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
    pub bundle_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pool_size: POOL_SIZE,
            idle_timeout: IDLE_TIMEOUT,
            execution_timeout: EXECUTION_TIMEOUT,
            cleanup_interval: CLEANUP_INTERVAL,
            bundle_timeout: BUNDLE_TIMEOUT,
            memory_mb: MEMORY_LIMIT_MB,
            cpus: CPU_LIMIT,
            pids_limit: PIDS_LIMIT,
            scratch_size_mb: SCRATCH_SIZE_MB,
            image: SANDBOX_IMAGE.to_string(),
            image_context: PathBuf::from(SANDBOX_IMAGE_CONTEXT),
            user: SANDBOX_USER.to_string(),
            uid: SANDBOX_UID.to_string(),
            stdout_limit: STDOUT_LIMIT_BYTES,
            stderr_limit: STDERR_LIMIT_BYTES,
            bundle_limit: BUNDLE_LIMIT_BYTES,
        }
    }
}

impl SandboxConfig {
    pub fn container_spec(&self) -> ContainerSpec {
        ContainerSpec {
            image: self.image.clone(),
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            pids_limit: self.pids_limit,
            scratch_dir: SCRATCH_DIR.to_string(),
            scratch_size_mb: self.scratch_size_mb,
            label: POOL_LABEL.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    pub queue: String,
    pub concurrency: usize,
    pub rate_per_sec: u32,
}

impl WorkerConfig {
    pub fn execution() -> Self {
        Self {
            queue: EXECUTION_QUEUE.to_string(),
            concurrency: EXECUTION_CONCURRENCY,
            rate_per_sec: EXECUTION_RATE_PER_SEC,
        }
    }

    pub fn grading() -> Self {
        Self {
            queue: GRADING_QUEUE.to_string(),
            concurrency: GRADING_CONCURRENCY,
            rate_per_sec: GRADING_RATE_PER_SEC,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner", version, about = "Sandboxed code execution workers")]
pub struct Args {
    /// Number of pre-warmed sandbox containers
    #[arg(long, env = "SANDBOX_POOL_SIZE", default_value_t = POOL_SIZE)]
    pub pool_size: usize,

    /// Seconds an idle pooled container survives before being recycled
    #[arg(long, env = "SANDBOX_IDLE_TIMEOUT_SECS", default_value_t = IDLE_TIMEOUT.as_secs())]
    pub idle_timeout_secs: u64,

    /// Wall-clock budget of one program run
    #[arg(long, env = "SANDBOX_EXECUTION_TIMEOUT_SECS", default_value_t = EXECUTION_TIMEOUT.as_secs())]
    pub execution_timeout_secs: u64,

    #[arg(long, env = "SANDBOX_CLEANUP_INTERVAL_SECS", default_value_t = CLEANUP_INTERVAL.as_secs())]
    pub cleanup_interval_secs: u64,

    #[arg(long, env = "SANDBOX_BUNDLE_TIMEOUT_SECS", default_value_t = BUNDLE_TIMEOUT.as_secs())]
    pub bundle_timeout_secs: u64,

    #[arg(long, env = "SANDBOX_MEMORY_MB", default_value_t = MEMORY_LIMIT_MB)]
    pub memory_mb: u64,

    #[arg(long, env = "SANDBOX_CPUS", default_value_t = CPU_LIMIT)]
    pub cpus: f64,

    #[arg(long, env = "SANDBOX_IMAGE", default_value = SANDBOX_IMAGE)]
    pub image: String,

    /// Directory holding the sandbox image's Dockerfile
    #[arg(long, env = "SANDBOX_IMAGE_CONTEXT", default_value = SANDBOX_IMAGE_CONTEXT)]
    pub image_context: PathBuf,

    #[arg(long, env = "DOCKER_PATH", default_value = "docker")]
    pub docker_path: PathBuf,

    #[arg(long, env = "EXECUTION_CONCURRENCY", default_value_t = EXECUTION_CONCURRENCY)]
    pub execution_concurrency: usize,

    #[arg(long, env = "EXECUTION_RATE_PER_SEC", default_value_t = EXECUTION_RATE_PER_SEC)]
    pub execution_rate: u32,

    #[arg(long, env = "GRADING_CONCURRENCY", default_value_t = GRADING_CONCURRENCY)]
    pub grading_concurrency: usize,

    #[arg(long, env = "GRADING_RATE_PER_SEC", default_value_t = GRADING_RATE_PER_SEC)]
    pub grading_rate: u32,

    #[arg(long, env = "MAX_DELIVERY_ATTEMPTS", default_value_t = MAX_DELIVERY_ATTEMPTS)]
    pub max_attempts: u32,
}

impl Args {
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            pool_size: self.pool_size,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            execution_timeout: Duration::from_secs(self.execution_timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            bundle_timeout: Duration::from_secs(self.bundle_timeout_secs),
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            image: self.image.clone(),
            image_context: self.image_context.clone(),
            ..SandboxConfig::default()
        }
    }

    pub fn execution_worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.execution_concurrency,
            rate_per_sec: self.execution_rate,
            ..WorkerConfig::execution()
        }
    }

    pub fn grading_worker(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.grading_concurrency,
            rate_per_sec: self.grading_rate,
            ..WorkerConfig::grading()
        }
    }
}
