//! Process execution for conveyor.
//!
//! Every external tool conveyor drives (`cvmfs_server`, `tar`, transaction
//! scripts) goes through here so that exit status and captured output are
//! reported the same way.
//!
//! # Example
//!
//! ```ignore
//! use conveyor_process::run_command;
//!
//! let result = run_command("tar", &["--version"]).expect("run");
//! assert!(result.success);
//! ```

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Number of trailing output lines kept in error messages.
pub const DEFAULT_TAIL_LINES: usize = 20;

/// Result of a command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    /// Rendered command line, for messages
    pub command: String,
    /// Whether the command exited with status 0
    pub success: bool,
    /// Exit code (absent when killed by a signal)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandResult {
    /// Turn a non-zero exit into an error carrying the tail of stderr.
    pub fn ok(&self) -> Result<&Self> {
        if self.success {
            Ok(self)
        } else {
            Err(anyhow::anyhow!(
                "`{}` failed with exit code {}: {}",
                self.command,
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                tail(&self.stderr, DEFAULT_TAIL_LINES)
            ))
        }
    }

    fn from_output(command: String, output: &Output, duration: Duration) -> Self {
        Self {
            command,
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: duration.as_millis() as u64,
        }
    }
}

/// Last `lines` lines of `text`, trimmed.
pub fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

fn render<S: AsRef<OsStr>>(program: &str, args: &[S]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&arg.as_ref().to_string_lossy());
    }
    line
}

fn execute(command: String, cmd: &mut Command) -> Result<CommandResult> {
    let start = Instant::now();
    let output = cmd
        .output()
        .with_context(|| format!("failed to run command: {command}"))?;
    Ok(CommandResult::from_output(command, &output, start.elapsed()))
}

/// Run a command and capture its output
pub fn run_command<S: AsRef<OsStr>>(program: &str, args: &[S]) -> Result<CommandResult> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    execute(render(program, args), &mut cmd)
}

/// Run a command in a specific working directory
pub fn run_command_in_dir<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    dir: &Path,
) -> Result<CommandResult> {
    let program = program.as_ref();
    let line = render(&program.to_string_lossy(), args);
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(dir);
    execute(format!("{line} (in {})", dir.display()), &mut cmd)
}

/// Get the full path to a command
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}
