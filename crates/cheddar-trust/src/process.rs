//! External process invocation.
//!
//! Every OS-facing operation in this crate goes through a [`ProcessInvoker`] so
//! the whole subsystem can run against a simulated OS in tests.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{Result, TrustError};

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code (`None` when terminated by a signal).
    pub code: Option<i32>,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

impl ProcessOutput {
    /// Builds a successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Builds a failed output with the given exit code and stderr.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true when the process exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Converts a non-zero exit into [`TrustError::NonZeroExit`].
    pub fn into_success(self, program: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(TrustError::NonZeroExit {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }

    /// Standard output and standard error joined, lowercased.
    ///
    /// Several tools print their "already done" messages on either stream.
    pub fn combined_lowercase(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).to_lowercase()
    }
}

/// Runs an external program and captures its output.
#[async_trait]
pub trait ProcessInvoker: Send + Sync {
    /// Runs `program` with `args` and waits for it to exit.
    ///
    /// Returns [`TrustError::ToolUnavailable`] if the program cannot be
    /// spawned. A non-zero exit is NOT an error at this level.
    async fn run(&self, program: &str, args: &[&str]) -> Result<ProcessOutput>;
}

/// Production invoker backed by `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessInvoker;

impl TokioProcessInvoker {
    /// Creates a new invoker.
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessInvoker for TokioProcessInvoker {
    async fn run(&self, program: &str, args: &[&str]) -> Result<ProcessOutput> {
        tracing::debug!(program, ?args, "running external tool");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let output = command
            .output()
            .await
            .map_err(|source| TrustError::ToolUnavailable {
                program: program.to_string(),
                source,
            })?;

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
