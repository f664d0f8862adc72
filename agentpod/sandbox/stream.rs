//! Streaming exec: live output, a bounded wait, and kill.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::backend::{BackendExecStream, RemoteTerminator};
use super::error::SandboxError;
use super::handle::Sandbox;
use super::kube::models::ExecStatus;
use super::pod_spec::CONTAINER_NAME;
use super::shell::{build_command, display_command};
use super::types::{ExecResult, ExecStreamRequest};

/// Exit code reported by `wait` after `kill`, as a shell reports SIGKILL.
pub const KILLED_EXIT_CODE: i32 = 137;

struct KillState {
    killed: AtomicBool,
    terminator: Box<dyn RemoteTerminator>,
}

/// Cloneable handle that terminates the remote process from any task.
#[derive(Clone)]
pub struct ExecKiller {
    state: Arc<KillState>,
    command: Arc<str>,
}

impl ExecKiller {
    /// Ask the backend to end the process. Once a kill has succeeded,
    /// further calls do nothing; a failed kill can be retried.
    pub async fn kill(&self) -> Result<(), SandboxError> {
        if self.state.killed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(command = %self.command, "killing streaming exec");
        if let Err(e) = self.state.terminator.terminate().await {
            self.state.killed.store(false, Ordering::Release);
            tracing::warn!(command = %self.command, error = %e, "failed to kill streaming exec");
            return Err(SandboxError::exec(&self.command, e));
        }
        Ok(())
    }

    pub fn is_killed(&self) -> bool {
        self.state.killed.load(Ordering::Acquire)
    }
}

/// A command running inside a sandbox with its output streaming back.
pub struct SandboxExecStream {
    stdout: mpsc::Receiver<Vec<u8>>,
    stderr: mpsc::Receiver<Vec<u8>>,
    status: oneshot::Receiver<ExecStatus>,
    exit_code: Option<i32>,
    /// The status channel closed without a status.
    lost: bool,
    killer: ExecKiller,
    timeout: Duration,
}

impl SandboxExecStream {
    pub(crate) fn new(stream: BackendExecStream, command: String, timeout: Duration) -> Self {
        Self {
            stdout: stream.stdout,
            stderr: stream.stderr,
            status: stream.status,
            exit_code: None,
            lost: false,
            killer: ExecKiller {
                state: Arc::new(KillState {
                    killed: AtomicBool::new(false),
                    terminator: stream.terminator,
                }),
                command: command.into(),
            },
            timeout,
        }
    }

    pub fn command(&self) -> &str {
        &self.killer.command
    }

    pub fn stdout(&mut self) -> &mut mpsc::Receiver<Vec<u8>> {
        &mut self.stdout
    }

    pub fn stderr(&mut self) -> &mut mpsc::Receiver<Vec<u8>> {
        &mut self.stderr
    }

    pub fn killer(&self) -> ExecKiller {
        self.killer.clone()
    }

    /// Wait for the process to exit and return its exit code.
    ///
    /// Does not require the output streams to be drained: output that
    /// nobody reads is dropped once its buffer is full.
    ///
    /// Fails with `ExecTimeout` if the process is still running when the
    /// timeout elapses; the process is left running and `wait` may be
    /// called again.
    pub async fn wait(&mut self) -> Result<i32, SandboxError> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        if self.lost {
            return Err(self.lost_error());
        }
        let outcome = tokio::time::timeout(self.timeout, &mut self.status).await;
        let code = match outcome {
            Err(_) => return Err(SandboxError::ExecTimeout(self.timeout)),
            Ok(Ok(status)) => status.normalized_exit_code(),
            Ok(Err(_)) if self.killer.is_killed() => KILLED_EXIT_CODE,
            Ok(Err(_)) => {
                self.lost = true;
                return Err(self.lost_error());
            }
        };
        self.exit_code = Some(code);
        Ok(code)
    }

    fn lost_error(&self) -> SandboxError {
        SandboxError::ExecFailed {
            command: self.killer.command.to_string(),
            message: "connection closed before the process reported an exit status".into(),
        }
    }

    /// Drain both streams to the end, then wait for the exit code.
    pub async fn output(&mut self) -> Result<ExecResult, SandboxError> {
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let (mut out_done, mut err_done) = (false, false);
        while !(out_done && err_done) {
            tokio::select! {
                chunk = self.stdout.recv(), if !out_done => match chunk {
                    Some(c) => out.extend_from_slice(&c),
                    None => out_done = true,
                },
                chunk = self.stderr.recv(), if !err_done => match chunk {
                    Some(c) => err.extend_from_slice(&c),
                    None => err_done = true,
                },
            }
        }
        let exit_code = self.wait().await?;
        Ok(ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&out).trim().to_string(),
            stderr: String::from_utf8_lossy(&err).trim().to_string(),
        })
    }

    /// Stop reading locally, then terminate the remote process. Safe to call
    /// more than once.
    pub async fn kill(&mut self) -> Result<(), SandboxError> {
        self.stdout.close();
        self.stderr.close();
        self.killer.kill().await
    }
}

impl Sandbox {
    /// Start a command and stream its output.
    ///
    /// With `cwd` the command runs under `sh -c` after a `cd`; without it
    /// the argv is sent as-is (behind `env` when variables are set).
    pub async fn exec_stream(&self, req: ExecStreamRequest) -> Result<SandboxExecStream, SandboxError> {
        self.ensure_active()?;
        let argv = build_command(&req.command, &req.args, &req.env, req.cwd.as_deref())?;
        let shown = display_command(&argv);
        self.touch();

        let stream = self
            .backend
            .exec_stream(self.namespace(), self.container_id(), CONTAINER_NAME, &argv)
            .await
            .map_err(|e| {
                tracing::warn!(sandbox_id = %self.id(), error = %e, "failed to start streaming exec");
                SandboxError::exec(&shown, e)
            })?;

        tracing::debug!(sandbox_id = %self.id(), command = %shown, "streaming exec started");
        Ok(SandboxExecStream::new(
            stream,
            shown,
            req.timeout.unwrap_or(self.exec_stream_timeout),
        ))
    }
}
