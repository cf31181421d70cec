//! Runs one submission inside a leased sandbox container.

pub mod bundle;
pub mod classifier;
pub mod plots;
pub mod staging;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    config::SandboxConfig,
    constants::{KILL_GRACE_SECS, SCRATCH_DIR, TIMEOUT_MSG_PREFIX},
    core::{
        domain::{ExecutionRequest, ExecutionResult, ExecutionStatus},
        protocol::{
            bundle::{BundleError, build_bundle},
            classifier::{ArtifactClassifier, ArtifactKind},
            plots::{extract_plots, with_plot_shim},
            staging::Scratch,
        },
        traits::{
            executor::SandboxError,
            runtime::{ExecOutput, ExecRequest, SandboxRuntime},
        },
    },
};

const ENTRYPOINT: &str = "main.py";
const HEADLESS_ENV: &[(&str, &str)] = &[("SDL_VIDEODRIVER", "dummy"), ("SDL_AUDIODRIVER", "dummy")];
const TERMINATE_ATTEMPTS: u32 = 3;
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub result: ExecutionResult,
    /// False when the container may still host leftovers of this run.
    pub reusable: bool,
}

#[derive(Debug)]
pub struct ExecutionProtocol {
    runtime: Arc<dyn SandboxRuntime>,
    classifier: Arc<dyn ArtifactClassifier>,
    config: SandboxConfig,
}

impl ExecutionProtocol {
    pub fn new(
        runtime: Arc<dyn SandboxRuntime>,
        classifier: Arc<dyn ArtifactClassifier>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            runtime,
            classifier,
            config,
        }
    }

    #[tracing::instrument(skip(self, request), fields(code_len = request.code.len()))]
    pub async fn run(
        &self,
        container_id: &str,
        request: &ExecutionRequest,
    ) -> Result<RunOutcome, SandboxError> {
        let kind = self.classifier.classify(&request.code);
        tracing::debug!("Artifact kind: {:?}", kind);

        let run_id = Uuid::new_v4().to_string();
        let scratch = Scratch::new(
            self.runtime.as_ref(),
            container_id,
            SCRATCH_DIR,
            &run_id,
            &self.config.user,
        );

        let outcome = match kind {
            ArtifactKind::InteractiveGraphics => {
                self.run_interactive(container_id, &scratch, request).await
            }
            ArtifactKind::Plotting => {
                let source = with_plot_shim(&request.code);
                self.run_program(container_id, &scratch, &source, request, &[], true)
                    .await
            }
            ArtifactKind::None => {
                self.run_program(container_id, &scratch, &request.code, request, &[], false)
                    .await
            }
        };

        let cleaned = scratch.remove().await;
        outcome.map(|mut outcome| {
            outcome.reusable &= cleaned;
            outcome
        })
    }

    async fn run_program(
        &self,
        container_id: &str,
        scratch: &Scratch<'_>,
        source: &str,
        request: &ExecutionRequest,
        env: &[(&str, &str)],
        capture_plots: bool,
    ) -> Result<RunOutcome, SandboxError> {
        scratch.write(ENTRYPOINT, source.as_bytes()).await?;

        let budget = self.config.execution_timeout;
        // Backstop in case the host-side kill does not reach the process.
        let kill_after = format!("{}", budget.as_secs_f64() + KILL_GRACE_SECS as f64);
        let mut exec = ExecRequest::new(
            ["timeout", "-s", "KILL", kill_after.as_str(), "python3", ENTRYPOINT],
            budget,
        )
        .user(&self.config.user)
        .workdir(scratch.dir())
        .env("HOME", scratch.dir())
        .env("MPLBACKEND", "Agg")
        .env("PYTHONDONTWRITEBYTECODE", "1")
        .limits(self.config.stdout_limit, self.config.stderr_limit);
        for (key, value) in env {
            exec = exec.env(key, value);
        }
        if let Some(stdin) = &request.stdin {
            exec = exec.stdin(stdin.as_bytes());
        }

        let started = Instant::now();
        let output = self.runtime.exec(container_id, &exec).await?;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let reusable = if output.timed_out {
            tracing::warn!(container = %container_id, "Execution timed out");
            self.terminate(container_id).await
        } else {
            true
        };

        let truncated = output.truncated;
        let (status, stderr) = classify(&output, budget);
        let (stdout, plots) = if capture_plots {
            let (stdout, plots) = extract_plots(&output.stdout);
            (stdout, (!plots.is_empty()).then_some(plots))
        } else {
            (output.stdout, None)
        };

        Ok(RunOutcome {
            result: ExecutionResult {
                stdout,
                stderr,
                status,
                execution_time_ms,
                plots,
                pygame_bundle: None,
                bundle_fallback: None,
                truncated,
            },
            reusable,
        })
    }

    async fn run_interactive(
        &self,
        container_id: &str,
        scratch: &Scratch<'_>,
        request: &ExecutionRequest,
    ) -> Result<RunOutcome, SandboxError> {
        scratch.write(ENTRYPOINT, request.code.as_bytes()).await?;

        let started = Instant::now();
        let reason = match build_bundle(self.runtime.as_ref(), container_id, scratch, &self.config)
            .await
        {
            Ok(bundle) => {
                return Ok(RunOutcome {
                    result: ExecutionResult {
                        stdout: String::new(),
                        stderr: String::new(),
                        status: ExecutionStatus::Success,
                        execution_time_ms: started.elapsed().as_millis() as u64,
                        plots: None,
                        pygame_bundle: Some(bundle),
                        bundle_fallback: None,
                        truncated: false,
                    },
                    reusable: true,
                });
            }
            Err(BundleError::Sandbox(e @ SandboxError::Infrastructure(_))) => return Err(e),
            Err(reason) => reason,
        };

        tracing::warn!(container = %container_id, "Bundling failed, running directly: {}", reason);
        if matches!(reason, BundleError::TimedOut(_)) && !self.terminate(container_id).await {
            return Ok(RunOutcome {
                result: ExecutionResult {
                    stdout: String::new(),
                    stderr: reason.to_string(),
                    status: ExecutionStatus::Timeout,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    plots: None,
                    pygame_bundle: None,
                    bundle_fallback: Some(reason.to_string()),
                    truncated: false,
                },
                reusable: false,
            });
        }

        let mut outcome = self
            .run_program(
                container_id,
                scratch,
                &request.code,
                request,
                HEADLESS_ENV,
                false,
            )
            .await?;
        outcome.result.bundle_fallback = Some(reason.to_string());
        Ok(outcome)
    }

    /// Kills every process of the sandbox user and confirms none survived.
    async fn terminate(&self, container_id: &str) -> bool {
        let uid = self.config.uid.as_str();
        let kill = ExecRequest::new(["pkill", "-KILL", "-u", uid], TERMINATE_TIMEOUT)
            .user(&self.config.user);
        let check =
            ExecRequest::new(["pgrep", "-u", uid], TERMINATE_TIMEOUT).user(&self.config.user);

        for attempt in 1..=TERMINATE_ATTEMPTS {
            if let Err(e) = self.runtime.exec(container_id, &kill).await {
                tracing::error!(container = %container_id, "Kill failed: {}", e);
                return false;
            }

            match self.runtime.exec(container_id, &check).await {
                // pgrep exits with 1 when nothing matched
                Ok(output) if output.exit_code == Some(1) => return true,
                Ok(_) => {
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => {
                    tracing::error!(container = %container_id, "Process check failed: {}", e);
                    return false;
                }
            }
        }

        tracing::error!(container = %container_id, "Could not confirm termination");
        false
    }
}

fn classify(output: &ExecOutput, budget: Duration) -> (ExecutionStatus, String) {
    if output.timed_out {
        return (ExecutionStatus::Timeout, timeout_message(budget));
    }
    if !output.stderr.is_empty() {
        return (ExecutionStatus::Error, output.stderr.clone());
    }

    match output.exit_code {
        Some(0) => (ExecutionStatus::Success, String::new()),
        Some(137) => (
            ExecutionStatus::Error,
            "Process was killed (exit code 137), most likely for exceeding the memory limit"
                .to_string(),
        ),
        Some(code) => (
            ExecutionStatus::Error,
            format!("Process exited with code {code}"),
        ),
        None => (
            ExecutionStatus::Error,
            "Process was terminated by a signal".to_string(),
        ),
    }
}

pub fn timeout_message(budget: Duration) -> String {
    let budget = if budget.subsec_nanos() == 0 {
        format!("{}s", budget.as_secs())
    } else {
        format!("{}ms", budget.as_millis())
    };
    format!(
        "{TIMEOUT_MSG_PREFIX} {budget}. Check for infinite loops or code waiting for more input."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        protocol::classifier::ImportClassifier,
        traits::runtime::{MockSandboxRuntime, RuntimeError},
    };
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        staged: Mutex<Vec<String>>,
        programs: Mutex<Vec<ExecRequest>>,
        removed: AtomicUsize,
        killed: AtomicUsize,
        survivors: AtomicBool,
        bundles: AtomicUsize,
        missing: Mutex<Option<&'static str>>,
    }

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            exit_code: Some(0),
            ..ExecOutput::default()
        }
    }

    fn failed(code: i32, stderr: &str) -> ExecOutput {
        ExecOutput {
            stderr: stderr.to_string(),
            exit_code: Some(code),
            ..ExecOutput::default()
        }
    }

    fn timed_out() -> ExecOutput {
        ExecOutput {
            timed_out: true,
            ..ExecOutput::default()
        }
    }

    /// Answers the protocol's housekeeping commands and hands program and
    /// bundler invocations to the given closures.
    fn runtime<P, B>(calls: Arc<Calls>, program: P, bundler: B) -> MockSandboxRuntime
    where
        P: Fn(&ExecRequest) -> Result<ExecOutput, RuntimeError> + Send + 'static,
        B: Fn(&ExecRequest) -> ExecOutput + Send + 'static,
    {
        let mut runtime = MockSandboxRuntime::new();
        runtime.expect_exec().returning(move |_, req| {
            match (req.args[0].as_str(), req.args.get(3).map(String::as_str)) {
                ("sh", Some("stage")) => {
                    let stdin = req.stdin.clone().unwrap_or_default();
                    let code = STANDARD.decode(stdin).unwrap();
                    calls
                        .staged
                        .lock()
                        .unwrap()
                        .push(String::from_utf8(code).unwrap());
                    Ok(ok(""))
                }
                ("sh", Some("read")) => {
                    let name = req.args[4].rsplit('/').next().unwrap().to_string();
                    if *calls.missing.lock().unwrap() == Some(name.as_str()) {
                        return Ok(failed(1, ""));
                    }
                    Ok(ok(&STANDARD.encode(name)))
                }
                ("rm", _) => {
                    calls.removed.fetch_add(1, Ordering::SeqCst);
                    Ok(ok(""))
                }
                ("pkill", _) => {
                    calls.killed.fetch_add(1, Ordering::SeqCst);
                    Ok(ok(""))
                }
                ("pgrep", _) if calls.survivors.load(Ordering::SeqCst) => Ok(ok("42\n")),
                ("pgrep", _) => Ok(failed(1, "")),
                (bundle::BUNDLER, _) => {
                    calls.bundles.fetch_add(1, Ordering::SeqCst);
                    Ok(bundler(req))
                }
                _ => {
                    calls.programs.lock().unwrap().push(req.clone());
                    program(req)
                }
            }
        });
        runtime
    }

    fn no_bundler(_: &ExecRequest) -> ExecOutput {
        panic!("bundler must not run")
    }

    fn protocol(runtime: MockSandboxRuntime) -> ExecutionProtocol {
        ExecutionProtocol::new(
            Arc::new(runtime),
            Arc::new(ImportClassifier::default()),
            SandboxConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_hello_world() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(calls.clone(), |_| Ok(ok("hello\n")), no_bundler));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("print(\"hello\")", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.stdout, "hello\n");
        assert_eq!(outcome.result.stderr, "");
        assert_eq!(outcome.result.status, ExecutionStatus::Success);
        assert_eq!(outcome.result.plots, None);
        assert!(outcome.reusable);
        assert_eq!(*calls.staged.lock().unwrap(), vec!["print(\"hello\")"]);
        assert_eq!(calls.removed.load(Ordering::SeqCst), 1);

        let programs = calls.programs.lock().unwrap();
        let program = &programs[0];
        assert_eq!(program.args[0], "timeout");
        assert_eq!(program.args[4..], ["python3", "main.py"]);
        assert_eq!(program.user.as_deref(), Some("1000:1000"));
        assert_eq!(program.timeout, Duration::from_secs(10));
        assert_eq!(program.stdin, None);
    }

    #[tokio::test]
    async fn test_empty_code_is_a_valid_run() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(calls.clone(), |_| Ok(ok("")), no_bundler));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.stdout, "");
        assert_eq!(outcome.result.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_input_is_piped_to_stdin() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls.clone(),
            |req| {
                assert_eq!(req.stdin.as_deref(), Some(b"2\n3".as_slice()));
                Ok(ok("5\n"))
            },
            no_bundler,
        ));

        let request = ExecutionRequest::new(
            "print(int(input()) + int(input()))",
            Some("2\n3".to_string()),
        );
        let outcome = protocol.run("c0", &request).await.unwrap();

        assert_eq!(outcome.result.stdout, "5\n");
        let programs = calls.programs.lock().unwrap();
        assert!(!programs[0].args.iter().any(|a| a.contains("2\n3")));
    }

    #[tokio::test]
    async fn test_stderr_means_error() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls,
            |_| Ok(failed(1, "NameError: name 'x' is not defined\n")),
            no_bundler,
        ));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("print(x)", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.status, ExecutionStatus::Error);
        assert!(outcome.result.stderr.contains("NameError"));
        assert!(outcome.reusable);
    }

    #[tokio::test]
    async fn test_silent_nonzero_exit_is_reported() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(calls, |_| Ok(failed(3, "")), no_bundler));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("import sys; sys.exit(3)", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.status, ExecutionStatus::Error);
        assert_eq!(outcome.result.stderr, "Process exited with code 3");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_confirms() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(calls.clone(), |_| Ok(timed_out()), no_bundler));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("while True: pass", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.status, ExecutionStatus::Timeout);
        assert!(outcome.result.stderr.starts_with(TIMEOUT_MSG_PREFIX));
        assert!(outcome.result.stderr.contains("10s"));
        assert!(outcome.reusable);
        assert_eq!(calls.killed.load(Ordering::SeqCst), 1);
        assert_eq!(calls.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_termination_marks_container_unusable() {
        let calls = Arc::new(Calls::default());
        calls.survivors.store(true, Ordering::SeqCst);
        let protocol = protocol(runtime(calls.clone(), |_| Ok(timed_out()), no_bundler));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("while True: pass", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.status, ExecutionStatus::Timeout);
        assert!(!outcome.reusable);
        assert_eq!(
            calls.killed.load(Ordering::SeqCst),
            TERMINATE_ATTEMPTS as usize
        );
    }

    #[tokio::test]
    async fn test_plots_are_extracted_in_order() {
        let first = STANDARD.encode(b"png-1");
        let second = STANDARD.encode(b"png-2");
        let stdout = format!("start\n[PLOT_B64:{first}]\n[PLOT_B64:{second}]\nend\n");

        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls.clone(),
            move |_| Ok(ok(&stdout)),
            no_bundler,
        ));

        let code = concat!(
            "import matplotlib.pyplot as plt\n",
            "plt.plot([1])\nplt.show()\n",
            "plt.bar([0], [2])\nplt.show()",
        );
        let outcome = protocol
            .run("c0", &ExecutionRequest::new(code, None))
            .await
            .unwrap();

        assert_eq!(outcome.result.stdout, "start\nend\n");
        assert_eq!(
            outcome.result.plots,
            Some(vec![
                format!("data:image/png;base64,{first}"),
                format!("data:image/png;base64,{second}"),
            ])
        );
        let staged = calls.staged.lock().unwrap();
        assert!(staged[0].contains("__sbx_plt.show = __sbx_show"));
        assert!(staged[0].ends_with(code));
    }

    #[tokio::test]
    async fn test_markers_ignored_without_plotting_import() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls,
            |_| Ok(ok("[PLOT_B64:aGVsbG8=]\n")),
            no_bundler,
        ));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("print('[PLOT_B64:aGVsbG8=]')", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.stdout, "[PLOT_B64:aGVsbG8=]\n");
        assert_eq!(outcome.result.plots, None);
    }

    #[tokio::test]
    async fn test_scratch_removed_when_runtime_fails() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls.clone(),
            |_| Err(RuntimeError::Unavailable("daemon went away".to_string())),
            no_bundler,
        ));

        let result = protocol
            .run("c0", &ExecutionRequest::new("print(1)", None))
            .await;

        assert!(matches!(result, Err(SandboxError::Infrastructure(_))));
        assert_eq!(calls.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interactive_program_is_bundled() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls.clone(),
            |_| panic!("program must not run directly"),
            |_| ok(""),
        ));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("import pygame\npygame.init()", None))
            .await
            .unwrap();

        let bundle = outcome.result.pygame_bundle.unwrap();
        assert_eq!(bundle.html, STANDARD.encode("index.html"));
        assert_eq!(bundle.wasm, STANDARD.encode("index.wasm"));
        assert_eq!(bundle.data, STANDARD.encode("index.data"));
        assert_eq!(bundle.js, STANDARD.encode("index.js"));
        assert_eq!(outcome.result.stdout, "");
        assert_eq!(outcome.result.status, ExecutionStatus::Success);
        assert_eq!(outcome.result.bundle_fallback, None);
        assert_eq!(calls.bundles.load(Ordering::SeqCst), 1);
        assert_eq!(calls.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_bundle_falls_back_to_direct_run() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls.clone(),
            |_| Ok(ok("pygame 2.5.2\n")),
            |_| failed(2, "emcc: not found"),
        ));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("import pygame\nprint('hi')", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.pygame_bundle, None);
        assert_eq!(outcome.result.stdout, "pygame 2.5.2\n");
        assert!(
            outcome
                .result
                .bundle_fallback
                .as_deref()
                .unwrap()
                .contains("emcc: not found")
        );
        let programs = calls.programs.lock().unwrap();
        assert!(
            programs[0]
                .env
                .contains(&("SDL_VIDEODRIVER".to_string(), "dummy".to_string()))
        );
    }

    #[tokio::test]
    async fn test_missing_bundle_artifact_falls_back() {
        let calls = Arc::new(Calls::default());
        *calls.missing.lock().unwrap() = Some("index.wasm");
        let protocol = protocol(runtime(calls.clone(), |_| Ok(ok("ran\n")), |_| ok("")));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("import pygame", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.pygame_bundle, None);
        assert_eq!(outcome.result.stdout, "ran\n");
        assert_eq!(
            outcome.result.bundle_fallback.as_deref(),
            Some("bundler produced no index.wasm")
        );
        assert_eq!(calls.programs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bundle_timeout_terminates_then_falls_back() {
        let calls = Arc::new(Calls::default());
        let protocol = protocol(runtime(
            calls.clone(),
            |_| Ok(ok("ran\n")),
            |_| timed_out(),
        ));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("import pygame", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.status, ExecutionStatus::Success);
        assert_eq!(outcome.result.stdout, "ran\n");
        assert_eq!(
            outcome.result.bundle_fallback.as_deref(),
            Some("bundling timed out after 30s")
        );
        assert!(outcome.reusable);
        assert_eq!(calls.killed.load(Ordering::SeqCst), 1);
        assert_eq!(calls.programs.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bundle_timeout_with_survivors_is_a_timeout() {
        let calls = Arc::new(Calls::default());
        calls.survivors.store(true, Ordering::SeqCst);
        let protocol = protocol(runtime(
            calls.clone(),
            |_| panic!("program must not run after an unconfirmed kill"),
            |_| timed_out(),
        ));

        let outcome = protocol
            .run("c0", &ExecutionRequest::new("import pygame", None))
            .await
            .unwrap();

        assert_eq!(outcome.result.status, ExecutionStatus::Timeout);
        assert_eq!(outcome.result.pygame_bundle, None);
        assert!(outcome.result.bundle_fallback.is_some());
        assert!(!outcome.reusable);
        assert_eq!(
            calls.killed.load(Ordering::SeqCst),
            TERMINATE_ATTEMPTS as usize
        );
        assert_eq!(calls.removed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_message_formats_budget() {
        assert!(timeout_message(Duration::from_secs(10)).contains("after 10s."));
        assert!(timeout_message(Duration::from_millis(1500)).contains("after 1500ms."));
    }
}
