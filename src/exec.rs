// SPDX-License-Identifier: AGPL-3.0-or-later
//! External tool execution
//!
//! The pipeline drives the host through its native tools (apt-get, ufw,
//! iptables, systemctl, sshd, ss and friends). Commands are executed as
//! direct argv invocations with captured output and a timeout, and every
//! invocation lands in an ordered transcript so a run can be audited
//! afterwards. Dry-run swaps the system runner for one that only records.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{RedoubtError, Result};

/// Default per-command timeout
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// One external command to run
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub timeout_secs: u64,
}

impl ToolCall {
    /// Start building a call to the given program
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Add one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the command
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Override the timeout
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// The command as it would appear on a shell line
    pub fn rendered(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of one command
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// How a transcript entry ended
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum ToolOutcome {
    /// Ran to completion (successfully or not)
    Completed { exit_code: Option<i32> },
    /// Recorded in dry-run mode, never executed
    WouldRun,
    /// Could not be executed at all
    Failed { message: String },
}

/// One entry in the run transcript
#[derive(Debug, Clone, Serialize)]
pub struct ToolRecord {
    pub command: String,
    pub outcome: ToolOutcome,
}

/// Seam between the pipeline and the host's tools
#[async_trait]
pub trait ToolRunner: Send {
    /// Run a command; a non-zero exit is an expected outcome the caller
    /// inspects
    async fn run_unchecked(&mut self, call: ToolCall) -> Result<ToolOutput>;

    /// Whether this runner records instead of executing
    fn dry_run(&self) -> bool;

    /// Ordered transcript of every invocation so far
    fn transcript(&self) -> &[ToolRecord];

    /// Run a command and fail on a non-zero exit
    async fn run(&mut self, call: ToolCall) -> Result<ToolOutput> {
        let tool = call.program.clone();
        let output = self.run_unchecked(call).await?;

        if output.success {
            return Ok(output);
        }

        let mut message = match output.exit_code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            message.push_str(": ");
            message.push_str(stderr);
        }

        Err(RedoubtError::ToolFailed { tool, message })
    }
}

/// Runner that executes commands on the host
pub struct SystemTools {
    transcript: Vec<ToolRecord>,
}

impl SystemTools {
    pub fn new() -> Self {
        Self {
            transcript: Vec::new(),
        }
    }
}

impl Default for SystemTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRunner for SystemTools {
    async fn run_unchecked(&mut self, call: ToolCall) -> Result<ToolOutput> {
        let rendered = call.rendered();
        info!(command = %rendered, "Executing");

        let mut command = Command::new(&call.program);
        command.args(&call.args);
        for (key, value) in &call.env {
            command.env(key, value);
        }
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let child = match command.spawn() {
            Ok(child) => child,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                self.transcript.push(ToolRecord {
                    command: rendered,
                    outcome: ToolOutcome::Failed {
                        message: "not found".to_string(),
                    },
                });
                return Err(RedoubtError::ToolMissing { tool: call.program });
            }
            Err(error) => {
                self.transcript.push(ToolRecord {
                    command: rendered,
                    outcome: ToolOutcome::Failed {
                        message: error.to_string(),
                    },
                });
                return Err(error.into());
            }
        };

        let duration = Duration::from_secs(call.timeout_secs);
        match timeout(duration, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let exit_code = output.status.code();
                debug!(command = %rendered, code = ?exit_code, "Command finished");
                self.transcript.push(ToolRecord {
                    command: rendered,
                    outcome: ToolOutcome::Completed { exit_code },
                });
                Ok(ToolOutput {
                    success: output.status.success(),
                    exit_code,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                })
            }
            Ok(Err(error)) => {
                self.transcript.push(ToolRecord {
                    command: rendered,
                    outcome: ToolOutcome::Failed {
                        message: error.to_string(),
                    },
                });
                Err(RedoubtError::ToolFailed {
                    tool: call.program,
                    message: format!("failed to run: {}", error),
                })
            }
            Err(_) => {
                self.transcript.push(ToolRecord {
                    command: rendered,
                    outcome: ToolOutcome::Failed {
                        message: format!("timed out after {} seconds", call.timeout_secs),
                    },
                });
                Err(RedoubtError::ToolFailed {
                    tool: call.program,
                    message: format!("timed out after {} seconds", call.timeout_secs),
                })
            }
        }
    }

    fn dry_run(&self) -> bool {
        false
    }

    fn transcript(&self) -> &[ToolRecord] {
        &self.transcript
    }
}

/// Runner that records what it would execute
pub struct DryRunTools {
    transcript: Vec<ToolRecord>,
}

impl DryRunTools {
    pub fn new() -> Self {
        Self {
            transcript: Vec::new(),
        }
    }
}

impl Default for DryRunTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRunner for DryRunTools {
    async fn run_unchecked(&mut self, call: ToolCall) -> Result<ToolOutput> {
        let rendered = call.rendered();
        info!(command = %rendered, "[dry run] would execute");
        self.transcript.push(ToolRecord {
            command: rendered,
            outcome: ToolOutcome::WouldRun,
        });
        Ok(ToolOutput {
            success: true,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn dry_run(&self) -> bool {
        true
    }

    fn transcript(&self) -> &[ToolRecord] {
        &self.transcript
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let mut tools = SystemTools::new();
        let output = tools
            .run(ToolCall::new("echo").arg("transcript test"))
            .await
            .unwrap();
        assert!(output.success);
        assert!(output.stdout.contains("transcript test"));
        assert_eq!(tools.transcript().len(), 1);
        assert_eq!(tools.transcript()[0].command, "echo transcript test");
    }

    #[tokio::test]
    async fn test_run_fails_on_nonzero_exit() {
        let mut tools = SystemTools::new();
        let result = tools.run(ToolCall::new("false")).await;
        assert!(matches!(result, Err(RedoubtError::ToolFailed { .. })));
    }

    #[tokio::test]
    async fn test_run_unchecked_reports_nonzero_exit() {
        let mut tools = SystemTools::new();
        let output = tools.run_unchecked(ToolCall::new("false")).await.unwrap();
        assert!(!output.success);
        assert_eq!(output.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_tool_is_its_own_error() {
        let mut tools = SystemTools::new();
        let result = tools
            .run(ToolCall::new("redoubt-no-such-binary"))
            .await;
        assert!(matches!(result, Err(RedoubtError::ToolMissing { .. })));
    }

    #[tokio::test]
    async fn test_env_is_passed_through() {
        let mut tools = SystemTools::new();
        let output = tools
            .run(ToolCall::new("printenv").arg("REDOUBT_TEST").env("REDOUBT_TEST", "yes"))
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "yes");
    }

    #[tokio::test]
    async fn test_timeout_fails_the_call() {
        let mut tools = SystemTools::new();
        let result = tools
            .run(ToolCall::new("sleep").arg("5").timeout_secs(1))
            .await;
        match result {
            Err(RedoubtError::ToolFailed { message, .. }) => {
                assert!(message.contains("timed out"));
            }
            other => panic!("Expected timeout failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_dry_run_records_without_executing() {
        let mut tools = DryRunTools::new();
        let output = tools
            .run(ToolCall::new("ufw").args(["--force", "enable"]))
            .await
            .unwrap();
        assert!(output.success);
        assert_eq!(tools.transcript().len(), 1);
        assert_eq!(tools.transcript()[0].command, "ufw --force enable");
        assert!(matches!(
            tools.transcript()[0].outcome,
            ToolOutcome::WouldRun
        ));
    }

    #[test]
    fn test_rendered_command() {
        let call = ToolCall::new("iptables").args(["-C", "INPUT", "-i", "lo", "-j", "ACCEPT"]);
        assert_eq!(call.rendered(), "iptables -C INPUT -i lo -j ACCEPT");
        assert_eq!(ToolCall::new("sysctl").rendered(), "sysctl");
    }
}
