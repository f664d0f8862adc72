//! tmux sessions inside a sandbox, driven entirely through one-shot exec.

use super::error::SandboxError;
use super::handle::Sandbox;
use super::types::{ExecResult, TmuxSession};

const LIST_FORMAT: &str = "#{session_name}:#{session_windows}:#{session_attached}";
const TASK_PREFIX: &str = "agent-";

/// Session names end up as tmux targets, so keep them to a plain set.
pub fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

fn check_name(name: &str) -> Result<(), SandboxError> {
    if is_valid_session_name(name) {
        Ok(())
    } else {
        Err(SandboxError::InvalidSessionName(name.to_string()))
    }
}

/// `agent-<task>` sessions belong to a task.
pub fn task_id_from_session(name: &str) -> Option<String> {
    name.strip_prefix(TASK_PREFIX)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// tmux's ways of saying "there is nothing to list".
fn is_no_server(stderr: &str) -> bool {
    stderr.contains("no server running")
        || stderr.contains("no sessions")
        || stderr.contains("error connecting to")
}

fn is_session_missing(stderr: &str) -> bool {
    stderr.contains("can't find session")
        || stderr.contains("session not found")
        || is_no_server(stderr)
}

/// One `name:windows:attached` line. Returns `(name, windows, attached)`.
pub fn parse_session_line(line: &str) -> Option<(String, u32, bool)> {
    let mut parts = line.trim().rsplitn(3, ':');
    let attached = parts.next()?.trim();
    let windows = parts.next()?.trim().parse::<u32>().ok()?;
    let name = parts.next()?.to_string();
    if name.is_empty() {
        return None;
    }
    let attached = attached.parse::<u32>().map(|n| n > 0).unwrap_or(false);
    Some((name, windows, attached))
}

fn tmux_failure(action: &str, result: &ExecResult) -> SandboxError {
    SandboxError::ExecFailed {
        command: format!("tmux {action}"),
        message: format!("exit code {}: {}", result.exit_code, result.stderr),
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

impl Sandbox {
    pub async fn create_tmux_session(
        &self,
        name: &str,
        task_id: Option<&str>,
        cwd: Option<&str>,
    ) -> Result<TmuxSession, SandboxError> {
        check_name(name)?;
        if self
            .list_tmux_sessions()
            .await?
            .iter()
            .any(|s| s.name == name)
        {
            return Err(SandboxError::TmuxSessionExists(name.to_string()));
        }

        let mut cmd = argv(&["tmux", "new-session", "-d", "-s", name]);
        if let Some(dir) = cwd {
            cmd.push("-c".into());
            cmd.push(dir.to_string());
        }
        if let Some(task) = task_id {
            cmd.push("-e".into());
            cmd.push(format!("AGENTPOD_TASK_ID={task}"));
        }

        let result = self.run(&cmd).await?;
        if !result.success() {
            if result.stderr.contains("duplicate session") {
                return Err(SandboxError::TmuxSessionExists(name.to_string()));
            }
            return Err(tmux_failure("new-session", &result));
        }
        tracing::info!(sandbox_id = %self.id(), session = %name, "created tmux session");

        Ok(TmuxSession {
            name: name.to_string(),
            sandbox_id: self.id().to_string(),
            task_id: task_id
                .map(str::to_string)
                .or_else(|| task_id_from_session(name)),
            created_at: self.clock.now(),
            window_count: 1,
            attached: false,
        })
    }

    /// Sessions currently running. No tmux server means no sessions.
    pub async fn list_tmux_sessions(&self) -> Result<Vec<TmuxSession>, SandboxError> {
        let result = self
            .run(&argv(&["tmux", "list-sessions", "-F", LIST_FORMAT]))
            .await?;
        if !result.success() {
            if is_no_server(&result.stderr) {
                return Ok(Vec::new());
            }
            return Err(tmux_failure("list-sessions", &result));
        }

        let now = self.clock.now();
        Ok(result
            .stdout
            .lines()
            .filter_map(parse_session_line)
            .map(|(name, window_count, attached)| TmuxSession {
                task_id: task_id_from_session(&name),
                name,
                sandbox_id: self.id().to_string(),
                created_at: now,
                window_count,
                attached,
            })
            .collect())
    }

    /// Kill a session. Killing one that does not exist is not an error.
    pub async fn kill_tmux_session(&self, name: &str) -> Result<(), SandboxError> {
        check_name(name)?;
        let result = self
            .run(&argv(&["tmux", "kill-session", "-t", name]))
            .await?;
        if result.success() || is_session_missing(&result.stderr) {
            tracing::debug!(sandbox_id = %self.id(), session = %name, "tmux session gone");
            return Ok(());
        }
        Err(tmux_failure("kill-session", &result))
    }

    pub async fn send_keys_to_tmux(&self, name: &str, keys: &str, enter: bool) -> Result<(), SandboxError> {
        check_name(name)?;
        let mut cmd = argv(&["tmux", "send-keys", "-t", name, "-l", keys]);
        let result = self.run(&cmd).await?;
        if !result.success() {
            return Err(self.session_error(name, "send-keys", &result));
        }
        if enter {
            cmd = argv(&["tmux", "send-keys", "-t", name, "Enter"]);
            let result = self.run(&cmd).await?;
            if !result.success() {
                return Err(self.session_error(name, "send-keys", &result));
            }
        }
        Ok(())
    }

    /// The last `lines` lines of the session's active pane.
    pub async fn capture_tmux_pane(&self, name: &str, lines: u32) -> Result<String, SandboxError> {
        check_name(name)?;
        let start = format!("-{lines}");
        let result = self
            .run(&argv(&["tmux", "capture-pane", "-p", "-t", name, "-S", &start]))
            .await?;
        if !result.success() {
            return Err(self.session_error(name, "capture-pane", &result));
        }
        Ok(result.stdout)
    }

    fn session_error(&self, name: &str, action: &str, result: &ExecResult) -> SandboxError {
        if is_session_missing(&result.stderr) {
            SandboxError::TmuxSessionNotFound(name.to_string())
        } else {
            tmux_failure(action, result)
        }
    }
}
