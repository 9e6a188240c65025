//! Narrow interface over the external toolchain.
//!
//! The pipeline never shells out directly; every stage goes through
//! [`Toolchain::invoke`] so tests can swap in a scripted implementation.
//! [`ProcessToolchain`] is the real one: it spawns the tool, streams stdout
//! and stderr line by line to an optional sink as they arrive, and reports
//! the exit code.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::errors::PipelineError;

/// Pipeline stages that invoke an external tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Generate,
    Keystore,
    Build,
    Sign,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Generate => "Project generation",
            Stage::Keystore => "Keystore generation",
            Stage::Build => "APK build",
            Stage::Sign => "APK signing",
        };
        f.write_str(name)
    }
}

/// One external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Captured result of a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Turn a non-zero exit into a [`PipelineError::ToolFailure`] carrying
    /// the tool's own diagnostics verbatim.
    pub fn checked(self, stage: Stage) -> Result<ToolOutput, PipelineError> {
        if self.exit_code == 0 {
            return Ok(self);
        }
        let stderr = self.stderr.trim();
        let message = if !stderr.is_empty() {
            stderr.to_string()
        } else {
            let stdout = self.stdout.trim();
            if stdout.is_empty() {
                "tool produced no output".to_string()
            } else {
                stdout.to_string()
            }
        };
        Err(PipelineError::ToolFailure {
            stage,
            exit_code: self.exit_code,
            message,
        })
    }
}

/// Receives each output line as it arrives, before the tool exits.
pub type LineSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait Toolchain: Send + Sync {
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        on_line: Option<LineSink<'_>>,
    ) -> Result<ToolOutput, PipelineError>;
}

/// Spawns real external processes.
pub struct ProcessToolchain;

#[async_trait]
impl Toolchain for ProcessToolchain {
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        on_line: Option<LineSink<'_>>,
    ) -> Result<ToolOutput, PipelineError> {
        let spawn_err = |source: std::io::Error| PipelineError::SpawnFailed {
            stage: invocation.stage,
            source,
        };

        let mut child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_err(std::io::Error::other("stderr not captured")))?;

        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();

        // Drain both pipes concurrently so a chatty tool can never fill one
        // and deadlock against the other.
        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(sink) = on_line {
                            sink(&line);
                        }
                        stdout_buf.push_str(&line);
                        stdout_buf.push('\n');
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        };
        let stderr_task = async {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(sink) = on_line {
                            sink(&line);
                        }
                        stderr_buf.push_str(&line);
                        stderr_buf.push('\n');
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        };
        tokio::join!(stdout_task, stderr_task);

        let status = child.wait().await.map_err(spawn_err)?;

        Ok(ToolOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_buf,
            stderr: stderr_buf,
        })
    }
}
