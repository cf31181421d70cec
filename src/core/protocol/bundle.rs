use crate::{
    config::SandboxConfig,
    core::{
        domain::PygameBundle,
        protocol::staging::Scratch,
        traits::{
            executor::SandboxError,
            runtime::{ExecRequest, SandboxRuntime},
        },
    },
};

/// Bundler entry point shipped in the sandbox image.
pub const BUNDLER: &str = "sandbox-bundle";
pub const BUNDLE_DIR: &str = "bundle";

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("bundling timed out after {0}s")]
    TimedOut(u64),

    #[error("bundler exited with code {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("bundler produced no {0}")]
    MissingArtifact(&'static str),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// Cross-compiles an interactive program into a browser bundle, inside the
/// sandbox. `main.py` must already be staged in `scratch`.
pub async fn build_bundle(
    runtime: &dyn SandboxRuntime,
    container_id: &str,
    scratch: &Scratch<'_>,
    config: &SandboxConfig,
) -> Result<PygameBundle, BundleError> {
    let request = ExecRequest::new(
        [
            BUNDLER,
            scratch.path("main.py").as_str(),
            scratch.path(BUNDLE_DIR).as_str(),
        ],
        config.bundle_timeout,
    )
    .user(&config.user)
    .workdir(scratch.dir())
    .env("HOME", scratch.dir())
    .limits(64 * 1024, 64 * 1024);

    let output = runtime
        .exec(container_id, &request)
        .await
        .map_err(SandboxError::from)?;
    if output.timed_out {
        return Err(BundleError::TimedOut(config.bundle_timeout.as_secs()));
    }
    if !output.success() {
        return Err(BundleError::Failed {
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }

    Ok(PygameBundle {
        html: artifact(scratch, "index.html", config.bundle_limit).await?,
        wasm: artifact(scratch, "index.wasm", config.bundle_limit).await?,
        data: artifact(scratch, "index.data", config.bundle_limit).await?,
        js: artifact(scratch, "index.js", config.bundle_limit).await?,
    })
}

async fn artifact(
    scratch: &Scratch<'_>,
    name: &'static str,
    limit: usize,
) -> Result<String, BundleError> {
    scratch
        .read_base64(&format!("{BUNDLE_DIR}/{name}"), limit)
        .await?
        .ok_or(BundleError::MissingArtifact(name))
}
