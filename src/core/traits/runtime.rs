use std::path::Path;
use std::time::Duration;

/// Resource and isolation settings for one sandbox container.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids_limit: u32,
    pub scratch_dir: String,
    pub scratch_size_mb: u64,
    pub label: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecRequest {
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    /// `uid:gid` the command runs as; `None` keeps the container default.
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub stdout_limit: usize,
    pub stderr_limit: usize,
}

impl ExecRequest {
    pub fn new<I, S>(args: I, timeout: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            user: None,
            workdir: None,
            env: Vec::new(),
            timeout,
            stdout_limit: 64 * 1024,
            stderr_limit: 64 * 1024,
        }
    }

    pub fn stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn workdir(mut self, dir: &str) -> Self {
        self.workdir = Some(dir.to_string());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn limits(mut self, stdout: usize, stderr: usize) -> Self {
        self.stdout_limit = stdout;
        self.stderr_limit = stderr;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("sandbox runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{op} failed with exit code {code:?}: {stderr}")]
    CommandFailed {
        op: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::Io(e.to_string())
    }
}

/// Operations issued against the external container runtime.
#[mockall::automock]
#[async_trait::async_trait]
pub trait SandboxRuntime: std::fmt::Debug + Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn exec(&self, container_id: &str, request: &ExecRequest)
    -> Result<ExecOutput, RuntimeError>;

    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError>;

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    async fn build_image(&self, image: &str, context: &Path) -> Result<(), RuntimeError>;
}
