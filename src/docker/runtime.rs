use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::Command,
};

use crate::core::traits::runtime::{
    ContainerSpec, ExecOutput, ExecRequest, RuntimeError, SandboxRuntime,
};

#[derive(Clone, Debug)]
pub struct DockerCli {
    binary: PathBuf,
}

impl DockerCli {
    pub fn new<T: AsRef<Path>>(binary: T) -> Self {
        DockerCli {
            binary: binary.as_ref().into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true).stdin(Stdio::null());
        command
    }

    async fn output(&self, op: &'static str, args: &[String]) -> Result<Output, RuntimeError> {
        self.command()
            .args(args)
            .output()
            .await
            .map_err(|e| spawn_error(&self.binary, e))
            .inspect(|out| tracing::trace!(op, code = ?out.status.code(), "docker call"))
    }

    async fn checked(&self, op: &'static str, args: &[String]) -> Result<String, RuntimeError> {
        let out = self.output(op, args).await?;
        if !out.status.success() {
            return Err(RuntimeError::CommandFailed {
                op,
                code: out.status.code(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

fn spawn_error(binary: &Path, e: io::Error) -> RuntimeError {
    if e.kind() == io::ErrorKind::NotFound {
        RuntimeError::Unavailable(format!("{} not found", binary.display()))
    } else {
        RuntimeError::from(e)
    }
}

/// Arguments of `docker run` for a long-lived, locked-down sandbox. The
/// container idles as root; programs are exec'd as the unprivileged user.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = [
        "run",
        "-d",
        "--network",
        "none",
        "--read-only",
        "--cap-drop",
        "ALL",
        "--security-opt",
        "no-new-privileges",
    ]
    .into_iter()
    .map(String::from)
    .collect();

    args.extend([
        "--memory".to_string(),
        format!("{}m", spec.memory_mb),
        "--memory-swap".to_string(),
        format!("{}m", spec.memory_mb),
        "--cpus".to_string(),
        spec.cpus.to_string(),
        "--pids-limit".to_string(),
        spec.pids_limit.to_string(),
        "--tmpfs".to_string(),
        format!(
            "{}:rw,noexec,nosuid,size={}m,mode=1777",
            spec.scratch_dir, spec.scratch_size_mb
        ),
        "--label".to_string(),
        spec.label.clone(),
        spec.image.clone(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]);
    args
}

pub fn exec_args(container_id: &str, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if request.stdin.is_some() {
        args.push("-i".to_string());
    }
    if let Some(user) = &request.user {
        args.extend(["-u".to_string(), user.clone()]);
    }
    if let Some(dir) = &request.workdir {
        args.extend(["-w".to_string(), dir.clone()]);
    }
    for (key, value) in &request.env {
        args.extend(["-e".to_string(), format!("{key}={value}")]);
    }
    args.push(container_id.to_string());
    args.extend(request.args.iter().cloned());
    args
}

/// Reads up to `limit` bytes and discards the rest so the writer never
/// blocks on a full pipe. Returns whether anything was discarded.
async fn read_bounded<R>(mut reader: R, limit: usize) -> io::Result<(Vec<u8>, bool)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    (&mut reader).take(limit as u64).read_to_end(&mut buf).await?;
    let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    Ok((buf, discarded > 0))
}

#[async_trait::async_trait]
impl SandboxRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = self.checked("create", &create_args(spec)).await?;
        Ok(id.chars().take(12).collect())
    }

    async fn exec(
        &self,
        container_id: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, RuntimeError> {
        let mut child = self
            .command()
            .args(exec_args(container_id, request))
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&self.binary, e))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Io("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeError::Io("stderr not captured".to_string()))?;

        let feed = async {
            if let (Some(mut pipe), Some(data)) = (stdin, request.stdin.as_deref()) {
                // The program may exit without reading its input.
                match pipe.write_all(data).await {
                    Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
                let _ = pipe.shutdown().await;
            }
            Ok(())
        };

        let run = async {
            let (fed, out, err) = tokio::join!(
                feed,
                read_bounded(stdout, request.stdout_limit),
                read_bounded(stderr, request.stderr_limit),
            );
            fed?;
            let ((out, out_cut), (err, err_cut)) = (out?, err?);
            let status = child.wait().await?;
            Ok::<_, io::Error>(ExecOutput {
                stdout: String::from_utf8_lossy(&out).into_owned(),
                stderr: String::from_utf8_lossy(&err).into_owned(),
                exit_code: status.code(),
                timed_out: false,
                truncated: out_cut || err_cut,
            })
        };

        match tokio::time::timeout(request.timeout, run).await {
            Ok(result) => Ok(result?),
            Err(_) => {
                tracing::debug!(container = container_id, "docker exec deadline reached");
                if let Err(e) = child.start_kill() {
                    tracing::warn!("Failed to kill docker client: {}", e);
                }
                Ok(ExecOutput {
                    timed_out: true,
                    ..ExecOutput::default()
                })
            }
        }
    }

    async fn stop(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.checked(
            "stop",
            &["stop", "-t", "1", container_id].map(String::from),
        )
        .await
        .map(drop)
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.checked("rm", &["rm", "-f", container_id].map(String::from))
            .await
            .map(drop)
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        let out = self
            .output("image inspect", &["image", "inspect", image].map(String::from))
            .await?;
        Ok(out.status.success())
    }

    async fn build_image(&self, image: &str, context: &Path) -> Result<(), RuntimeError> {
        let args = [
            "build".to_string(),
            "-t".to_string(),
            image.to_string(),
            context.display().to_string(),
        ];
        self.checked("build", &args).await.map(drop)
    }
}
