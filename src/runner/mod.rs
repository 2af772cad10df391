//! Sandboxed execution of the external analysis tool.
//!
//! Each run copies the artifact into a fresh sandbox directory, invokes
//! the configured executable there with a hard deadline, and reads back
//! only the expected outputs that are regular files directly inside the
//! sandbox. The sandbox is removed afterwards whatever happened.

pub mod sandbox;

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::ToolConfig;
use crate::constants::{CAPTURE_FILENAME, MAX_CAPTURE_BYTES};
use crate::models::{OutputFiles, total_bytes};

pub use sandbox::SandboxWorkspace;

/// Errors that prevent a run from being attempted at all.
///
/// A tool that starts and then fails is not an error here; it is an
/// [`ExecutionResult`] with `success == false`.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("failed to prepare sandbox under {path}: {source}")]
    CreateSandbox {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to copy artifact {path} into sandbox: {source}")]
    CopyArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("executable {path} is not usable: {source}")]
    ExecutableNotFound {
        path: PathBuf,
        #[source]
        source: which::Error,
    },
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// What to run: one artifact, a fixed argument list, and the output
/// names to collect afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub artifact: PathBuf,
    pub args: Vec<String>,
    pub expected_outputs: Vec<String>,
}

/// The observable result of one run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub success: bool,
    /// Process exit code, or -1 when there is none (timeout, spawn failure, signal).
    pub exit_code: i32,
    /// Combined stdout and stderr, capped at [`MAX_CAPTURE_BYTES`].
    pub stdout: String,
    /// Failure description; empty on success.
    pub stderr: String,
    pub output_files: OutputFiles,
    pub duration: Duration,
}

enum Invocation {
    Exited(ExitStatus),
    TimedOut,
    SpawnFailed(io::Error),
    WaitFailed(io::Error),
}

/// Runs the external tool inside per-invocation sandboxes.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    executable: PathBuf,
    sandbox_root: PathBuf,
    timeout: Duration,
    max_output_bytes: u64,
}

impl ExecutionEngine {
    pub fn new(
        executable: impl Into<PathBuf>,
        sandbox_root: impl Into<PathBuf>,
        timeout: Duration,
        max_output_bytes: u64,
    ) -> Self {
        Self {
            executable: executable.into(),
            sandbox_root: sandbox_root.into(),
            timeout,
            max_output_bytes,
        }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(
            &config.executable_path,
            &config.sandbox_root,
            config.timeout(),
            config.max_output_bytes(),
        )
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the executable on `PATH` (or as given) and check it is runnable.
    pub fn validate_executable(&self) -> Result<PathBuf, RunnerError> {
        which::which(&self.executable).map_err(|source| RunnerError::ExecutableNotFound {
            path: self.executable.clone(),
            source,
        })
    }

    /// Run the tool once against `request.artifact`.
    ///
    /// The tool is invoked as `<executable> <args...> <artifact>` with the
    /// sandbox as working directory. Dropping the returned future kills the
    /// child and removes the sandbox.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, RunnerError> {
        let sandbox = SandboxWorkspace::create(&self.sandbox_root)
            .await
            .map_err(|source| RunnerError::CreateSandbox {
                path: self.sandbox_root.clone(),
                source,
            })?;

        let artifact = sandbox.import(&request.artifact).await.map_err(|source| {
            RunnerError::CopyArtifact {
                path: request.artifact.clone(),
                source,
            }
        })?;

        let capture_path = sandbox.path().join(CAPTURE_FILENAME);
        let (stdout, stderr) = capture_pipes(&capture_path)
            .await
            .map_err(|source| RunnerError::CreateSandbox {
                path: sandbox.path().to_path_buf(),
                source,
            })?;

        let mut command = Command::new(&self.executable);
        command
            .args(&request.args)
            .arg(&artifact)
            .current_dir(sandbox.path())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let invocation = self.invoke(&mut command).await;
        let duration = started.elapsed();

        let captured = read_capped(&capture_path, MAX_CAPTURE_BYTES)
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let output_files = self
            .collect_outputs(&sandbox, &request.expected_outputs, &artifact)
            .await;

        let (outcome, exit_code, failure) = match invocation {
            Invocation::Exited(status) if status.success() => {
                (ExecutionOutcome::Succeeded, 0, String::new())
            }
            Invocation::Exited(status) => (
                ExecutionOutcome::Failed,
                status.code().unwrap_or(-1),
                format!("tool {status}"),
            ),
            Invocation::TimedOut => (
                ExecutionOutcome::TimedOut,
                -1,
                format!("execution timed out after {}s", self.timeout.as_secs_f64()),
            ),
            Invocation::SpawnFailed(e) => (
                ExecutionOutcome::Failed,
                -1,
                format!("failed to start {}: {e}", self.executable.display()),
            ),
            Invocation::WaitFailed(e) => (
                ExecutionOutcome::Failed,
                -1,
                format!("failed to wait for {}: {e}", self.executable.display()),
            ),
        };

        let outputs = output_files.len();
        match outcome {
            ExecutionOutcome::Succeeded => tracing::info!(
                executable = %self.executable.display(),
                exit_code,
                duration_ms = duration.as_millis() as u64,
                outputs,
                output_bytes = total_bytes(&output_files),
                "tool run succeeded"
            ),
            _ => tracing::warn!(
                executable = %self.executable.display(),
                exit_code,
                ?outcome,
                duration_ms = duration.as_millis() as u64,
                outputs,
                "tool run failed: {failure}"
            ),
        }

        if let Err(e) = sandbox.remove().await {
            tracing::warn!("failed to remove sandbox, retrying on drop: {e}");
        }

        Ok(ExecutionResult {
            outcome,
            success: outcome == ExecutionOutcome::Succeeded,
            exit_code,
            stdout: captured,
            stderr: failure,
            output_files,
            duration,
        })
    }

    async fn invoke(&self, command: &mut Command) -> Invocation {
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return Invocation::SpawnFailed(e),
        };
        // Declared after `child` so it drops first, while the leader is
        // still unreaped and its group id cannot be reused.
        let mut group = ProcessGroup::new(child.id());

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                // The leader is reaped, so its group id may be reused.
                group.release();
                Invocation::Exited(status)
            }
            Ok(Err(e)) => Invocation::WaitFailed(e),
            Err(_) => {
                group.kill();
                if let Err(e) = child.kill().await {
                    tracing::warn!("failed to kill timed-out tool: {e}");
                }
                Invocation::TimedOut
            }
        }
    }

    /// Read each expected output that is a regular file directly inside
    /// the sandbox and no larger than the size cap.
    ///
    /// The capture file and the imported artifact are never outputs.
    /// Missing files are skipped silently; everything else that is skipped
    /// is logged. Collected and oversized files are deleted.
    async fn collect_outputs(
        &self,
        sandbox: &SandboxWorkspace,
        names: &[String],
        artifact: &Path,
    ) -> OutputFiles {
        let capture = sandbox.path().join(CAPTURE_FILENAME);
        let mut outputs = OutputFiles::new();
        for name in names {
            let Some(path) = sandbox.resolve_output(name) else {
                tracing::warn!(output = %name, "output name escapes the sandbox, ignoring");
                continue;
            };
            if path == capture || path == artifact {
                tracing::warn!(output = %name, "output name is reserved for the run's inputs, ignoring");
                continue;
            }

            let metadata = match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if !metadata.file_type().is_file() {
                tracing::warn!(output = %name, "output is not a regular file, ignoring");
                continue;
            }

            match read_capped(&path, self.max_output_bytes.saturating_add(1)).await {
                Ok(bytes) if bytes.len() as u64 > self.max_output_bytes => {
                    tracing::warn!(
                        output = %name,
                        limit = self.max_output_bytes,
                        "output exceeds size limit, discarding"
                    );
                }
                Ok(bytes) => {
                    outputs.insert(name.clone(), bytes);
                }
                Err(e) => tracing::warn!(output = %name, "failed to read output: {e}"),
            }
            let _ = tokio::fs::remove_file(&path).await;
        }
        outputs
    }
}

/// The tool's process group. Killing it also reaches anything the tool
/// forked. Killed at most once, and on drop unless released.
struct ProcessGroup {
    id: Option<u32>,
}

impl ProcessGroup {
    fn new(id: Option<u32>) -> Self {
        Self { id }
    }

    fn kill(&mut self) {
        if let Some(id) = self.id.take() {
            kill_group(id);
        }
    }

    fn release(&mut self) {
        self.id = None;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(id: u32) {
    let Ok(pgid) = libc::pid_t::try_from(id) else {
        return;
    };
    // SAFETY: `kill` has no memory-safety preconditions. A negative pid
    // addresses the process group the child leads.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_id: u32) {}

/// One capture file shared by stdout and stderr, so output interleaves in
/// the order the tool wrote it.
async fn capture_pipes(path: &Path) -> io::Result<(Stdio, Stdio)> {
    let file = tokio::fs::File::create(path).await?.into_std().await;
    let clone = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(clone)))
}

/// Read at most `limit` bytes from `path`.
async fn read_capped(path: &Path, limit: u64) -> io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut bytes = Vec::new();
    file.take(limit).read_to_end(&mut bytes).await?;
    Ok(bytes)
}
