use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};

use crate::core::traits::{
    executor::SandboxError,
    runtime::{ExecRequest, SandboxRuntime},
};

const STAGING_TIMEOUT: Duration = Duration::from_secs(10);

// Fixed scripts; file names only ever travel as positional arguments.
const WRITE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && base64 -d > "$1""#;
const READ_SCRIPT: &str = r#"test -f "$1" && base64 -w 0 "$1""#;

/// Per-run directory on the container's scratch tmpfs.
#[derive(Debug)]
pub struct Scratch<'a> {
    runtime: &'a dyn SandboxRuntime,
    container_id: &'a str,
    dir: String,
    user: &'a str,
}

impl<'a> Scratch<'a> {
    pub fn new(
        runtime: &'a dyn SandboxRuntime,
        container_id: &'a str,
        root: &str,
        run_id: &str,
        user: &'a str,
    ) -> Self {
        Self {
            runtime,
            container_id,
            dir: format!("{root}/{run_id}"),
            user,
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn path(&self, name: &str) -> String {
        format!("{}/{}", self.dir, name)
    }

    pub async fn write(&self, name: &str, content: &[u8]) -> Result<(), SandboxError> {
        let request = ExecRequest::new(
            ["sh", "-c", WRITE_SCRIPT, "stage", self.path(name).as_str()],
            STAGING_TIMEOUT,
        )
        .stdin(STANDARD.encode(content))
        .user(self.user);

        let output = self.runtime.exec(self.container_id, &request).await?;
        if !output.success() {
            return Err(SandboxError::Staging {
                msg: format!("failed to write {name}: {}", output.stderr.trim()),
            });
        }
        Ok(())
    }

    /// Reads a file back as base64 text. `None` when it does not exist.
    pub async fn read_base64(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Option<String>, SandboxError> {
        let request = ExecRequest::new(
            ["sh", "-c", READ_SCRIPT, "read", self.path(name).as_str()],
            STAGING_TIMEOUT,
        )
        .user(self.user)
        .limits(limit, 4096);

        let output = self.runtime.exec(self.container_id, &request).await?;
        if output.truncated {
            return Err(SandboxError::Staging {
                msg: format!("{name} exceeds {limit} bytes"),
            });
        }
        Ok(output.success().then_some(output.stdout))
    }

    /// Removes the directory. Returns whether the removal was confirmed.
    pub async fn remove(&self) -> bool {
        let request =
            ExecRequest::new(["rm", "-rf", self.dir.as_str()], STAGING_TIMEOUT).user(self.user);

        match self.runtime.exec(self.container_id, &request).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                tracing::warn!(
                    container = %self.container_id,
                    dir = %self.dir,
                    "Scratch cleanup failed: {}",
                    output.stderr.trim()
                );
                false
            }
            Err(e) => {
                tracing::warn!(container = %self.container_id, "Scratch cleanup failed: {}", e);
                false
            }
        }
    }
}
