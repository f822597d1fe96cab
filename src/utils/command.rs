use crate::network::error::{NetworkError, NetworkResult};
use std::process::Command;

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

pub struct CommandExecutor;

impl CommandExecutor {
    /// Run a program without a shell and capture its output.
    pub async fn execute(program: &str, args: &[&str]) -> NetworkResult<CommandResult> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(NetworkError::Io)?;

        Ok(CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }

    /// Like `execute`, but a non-zero exit becomes `NetworkError::Command`.
    pub async fn execute_checked(program: &str, args: &[&str]) -> NetworkResult<CommandResult> {
        let result = Self::execute(program, args).await?;
        if !result.success {
            return Err(NetworkError::Command {
                cmd: Self::render(program, args),
                stderr: result.stderr.trim().to_string(),
            });
        }
        Ok(result)
    }

    pub fn render(program: &str, args: &[&str]) -> String {
        let mut cmd = program.to_string();
        for arg in args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        cmd
    }

    /// Check if a command is available in the system PATH
    pub fn is_command_available(command: &str) -> bool {
        Command::new("which")
            .arg(command)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}
