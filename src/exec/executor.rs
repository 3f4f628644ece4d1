use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ExecConfig;
use crate::error::{AutodError, Result};
use crate::exec::capture::capture;

/// Exit code reported when the handler was killed for exceeding its deadline.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long output readers may keep going after the child has exited.
/// A grandchild that inherited the pipes can otherwise hold them open forever.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(50);

/// An execution request as received on `/exec` or forwarded by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    #[serde(alias = "path", alias = "command")]
    pub command_path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ExecRequest {
    pub fn new(command_path: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command_path: command_path.into(),
            args,
            timeout_ms: None,
        }
    }

    /// Typed view of a payload forwarded as-is. Unknown fields are ignored.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        Self::deserialize(payload)
            .map_err(|e| AutodError::Validation(format!("invalid exec payload: {}", e)))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Reject requests that cannot be turned into an argv.
    pub fn validate(&self) -> Result<()> {
        if self.command_path.trim().is_empty() {
            return Err(AutodError::Validation("command_path is required".to_string()));
        }
        if self.command_path.contains('\0') || self.args.iter().any(|a| a.contains('\0')) {
            return Err(AutodError::Validation(
                "command_path and args must not contain NUL bytes".to_string(),
            ));
        }
        Ok(())
    }
}

/// Limits applied to a single handler run.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
}

/// Outcome of one handler run.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub elapsed: Duration,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// JSON shape of an [`ExecResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<ExecResult> for ExecResponse {
    fn from(result: ExecResult) -> Self {
        Self {
            exit_code: result.exit_code,
            elapsed_ms: u64::try_from(result.elapsed.as_millis()).unwrap_or(u64::MAX),
            stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            timed_out: result.timed_out,
            error: result.error,
        }
    }
}

/// Runs handler programs with the node's execution limits.
#[derive(Debug, Clone)]
pub struct Executor {
    config: ExecConfig,
}

impl Executor {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Execute a request through the configured handler.
    pub async fn execute(&self, request: &ExecRequest) -> Result<ExecResult> {
        request.validate()?;

        let limits = ExecLimits {
            timeout: self.config.effective_timeout(request.timeout()),
            max_output_bytes: self.config.max_output_bytes,
            kill_grace: self.config.kill_grace,
        };

        tracing::info!(
            handler = %self.config.handler.display(),
            command = %request.command_path,
            args = ?request.args,
            timeout_ms = limits.timeout.as_millis() as u64,
            "Executing handler"
        );

        let result = run_handler(
            &self.config.handler,
            &request.command_path,
            &request.args,
            limits,
        )
        .await;

        match &result {
            Ok(r) => tracing::info!(
                command = %request.command_path,
                exit_code = r.exit_code,
                elapsed_ms = r.elapsed.as_millis() as u64,
                timed_out = r.timed_out,
                "Handler finished"
            ),
            Err(e) => {
                tracing::error!(command = %request.command_path, error = %e, "Handler failed")
            }
        }

        result
    }
}

/// Spawn `handler target args...`, wait for it under `limits.timeout` and
/// return its capped output.
///
/// The child runs in its own process group so a timeout also takes down
/// anything it forked. It is always reaped before this returns.
pub async fn run_handler(
    handler: &Path,
    target: &str,
    args: &[String],
    limits: ExecLimits,
) -> Result<ExecResult> {
    let started = Instant::now();
    let deadline = started + limits.timeout;

    let mut child = Command::new(handler)
        .arg(target)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| AutodError::SpawnFailed {
            handler: handler.display().to_string(),
            source,
        })?;

    let pid = child.id();
    let stop = CancellationToken::new();
    let stdout_task = child
        .stdout
        .take()
        .map(|out| tokio::spawn(capture(out, limits.max_output_bytes, stop.clone())));
    let stderr_task = child
        .stderr
        .take()
        .map(|err| tokio::spawn(capture(err, limits.max_output_bytes, stop.clone())));

    let (status, timed_out) = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(status) => (status?, false),
        Err(_) => {
            tracing::warn!(
                handler = %handler.display(),
                command = target,
                pid = ?pid,
                timeout_ms = limits.timeout.as_millis() as u64,
                "Handler exceeded deadline, terminating"
            );
            (terminate(&mut child, pid, limits.kill_grace).await?, true)
        }
    };

    let outputs = async { (join_capture(stdout_task).await, join_capture(stderr_task).await) };
    tokio::pin!(outputs);
    let (stdout, stderr) = match tokio::time::timeout(OUTPUT_DRAIN_GRACE, &mut outputs).await {
        Ok(captured) => captured,
        Err(_) => {
            stop.cancel();
            outputs.await
        }
    };

    let (exit_code, error) = if timed_out {
        (
            TIMEOUT_EXIT_CODE,
            Some(format!("timed out after {}ms", limits.timeout.as_millis())),
        )
    } else {
        (status_code(status), None)
    };

    Ok(ExecResult {
        exit_code,
        elapsed: started.elapsed(),
        stdout,
        stderr,
        timed_out,
        error,
    })
}

/// SIGTERM the process group, escalate to SIGKILL after `grace`, reap.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    if let Some(pid) = pid {
        signal_group(pid, Signal::SIGTERM);
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            // Leader is gone; make sure nothing it forked survives.
            if let Some(pid) = pid {
                signal_group(pid, Signal::SIGKILL);
            }
            status
        }
        Err(_) => {
            if let Some(pid) = pid {
                signal_group(pid, Signal::SIGKILL);
            }
            child.kill().await?;
            child.wait().await
        }
    }
}

fn signal_group(pid: u32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        // ESRCH just means the group already exited.
        tracing::debug!(pid, signal = signal.as_str(), error = %e, "Failed to signal process group");
    }
}

async fn join_capture(task: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

/// Child exit code, or `128 + signal` when it was killed by a signal.
fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(128)
}
