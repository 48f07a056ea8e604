//! One-shot command and script execution: `execute_command`/`execute_script` run to
//! completion and reply with a single response frame rather than opening a session, unlike
//! the streaming terminal/file/remote-desktop operations. Sandboxing the child process is
//! an external collaborator's job (out of scope here); this handler only spawns, captures
//! output, and reports the exit code.

use thiserror::Error;
use tokio::process::Command;

/// Errors from one-shot command/script execution.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The child process could not be spawned.
    #[error("failed to spawn command: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Captured result of a completed command or script run.
#[derive(Debug, serde::Serialize)]
pub struct CommandOutput {
    /// Process exit code; `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

/// Runs `execute_command`/`execute_script` requests to completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandHandler;

impl CommandHandler {
    /// Builds a handler. Stateless — every call spawns and awaits its own child.
    pub fn new() -> Self {
        Self
    }

    /// Runs a single command with arguments, waiting for it to exit.
    pub async fn execute_command(&self, command: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(command).args(args).output().await?;
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    /// Runs a multi-line script through the platform shell, waiting for it to exit.
    pub async fn execute_script(&self, script: &str) -> Result<CommandOutput, CommandError> {
        #[cfg(windows)]
        let output = Command::new("cmd").args(["/C", script]).output().await?;
        #[cfg(not(windows))]
        let output = Command::new("/bin/sh").args(["-c", script]).output().await?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_command_captures_stdout_and_exit_code() {
        let handler = CommandHandler::new();
        let result = handler
            .execute_command("echo", &["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "hello");
    }

    #[tokio::test]
    async fn execute_script_runs_through_the_shell() {
        let handler = CommandHandler::new();
        let result = handler.execute_script("echo one && echo two").await.unwrap();
        assert_eq!(result.exit_code, Some(0));
        let out = String::from_utf8_lossy(&result.stdout);
        assert!(out.contains("one"));
        assert!(out.contains("two"));
    }
}
