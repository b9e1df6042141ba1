//! Subprocess execution with a deadline.
//!
//! Every external tool (git, kustomize, docker, exec functions) runs through
//! [`run_with_timeout`]. Callers build a `std::process::Command`; the child is
//! driven by `tokio::process` on a current-thread runtime so the pipes and the
//! exit status are awaited together under one `tokio::time::timeout`.

use std::process::{Command, ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command as TokioCommand;

use crate::error::{HydrosError, Result};

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Renders a command as `program arg1 arg2` for error messages.
pub fn describe(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Runs `cmd` to completion, feeding `stdin` if given, or kills it at `timeout`.
///
/// A non-zero exit is not an error here; callers decide what failure means.
/// Must not be called from inside an async runtime.
pub fn run_with_timeout(
    cmd: &Command,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<CommandOutput> {
    let description = describe(cmd);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| HydrosError::BuildTool {
            command: description.clone(),
            message: format!("failed to start runtime: {}", e),
        })?;

    runtime.block_on(run_async(to_tokio(cmd), stdin, timeout, description))
}

/// Rebuilds `cmd` for tokio, leaving the caller's command intact for error reporting.
fn to_tokio(cmd: &Command) -> TokioCommand {
    let mut tokio_cmd = TokioCommand::new(cmd.get_program());
    tokio_cmd.args(cmd.get_args());
    if let Some(dir) = cmd.get_current_dir() {
        tokio_cmd.current_dir(dir);
    }
    for (key, value) in cmd.get_envs() {
        match value {
            Some(value) => tokio_cmd.env(key, value),
            None => tokio_cmd.env_remove(key),
        };
    }
    tokio_cmd
}

async fn run_async(
    mut cmd: TokioCommand,
    stdin: Option<Vec<u8>>,
    timeout: Duration,
    description: String,
) -> Result<CommandOutput> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| HydrosError::BuildTool {
        command: description.clone(),
        message: format!("failed to start: {}", e),
    })?;

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let write_task = async {
        if let (Some(mut pipe), Some(input)) = (stdin_pipe, stdin) {
            // A child that exits without reading closes the pipe early.
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        }
    };

    let stdout_task = async {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stdout_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };

    let stderr_task = async {
        let mut buf = Vec::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    };

    let completed = tokio::time::timeout(timeout, async {
        let ((), stdout, stderr, status) =
            tokio::join!(write_task, stdout_task, stderr_task, child.wait());
        (stdout, stderr, status)
    })
    .await;

    match completed {
        Ok((stdout, stderr, status)) => {
            let status = status.map_err(|e| HydrosError::BuildTool {
                command: description,
                message: format!("failed to wait: {}", e),
            })?;
            Ok(CommandOutput {
                status,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
        Err(_) => {
            log::warn!("Killing '{}' after {}s", description, timeout.as_secs());
            // The child may already be reaped while a grandchild holds its pipes.
            if matches!(child.try_wait(), Ok(None)) {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill '{}': {}", description, e);
                }
            }
            Err(HydrosError::ProcessTimeout {
                command: description,
                secs: timeout.as_secs(),
            })
        }
    }
}
