//! Shell executor: runs the task input as a `sh -c` command.
//!
//! - Timeout enforcement (the child is killed when the deadline passes)
//! - Output capture and truncation
//! - Blocked command patterns

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ExecutorError;
use crate::executors::{ExecutionOutput, ExecutionRequest, Executor};
use crate::tasks::{TaskContext, Usage};

/// Maximum output size before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Commands that are never run.
const BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    ":(){ :|:& };:",
    "dd if=/dev/zero",
    "mkfs",
    "chmod -r 777 /",
    "> /dev/sda",
];

/// Filesystem/shell executor.
#[derive(Debug)]
pub struct ShellExecutor {
    agent: String,
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            agent: "shell".to_string(),
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Serve a different agent tag.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn is_blocked(cmd: &str) -> bool {
        let normalized = cmd.to_lowercase();
        BLOCKED_COMMANDS.iter().any(|b| normalized.contains(b))
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn agent(&self) -> &str {
        &self.agent
    }

    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput, ExecutorError> {
        let cmd = request.input.trim();
        if cmd.is_empty() {
            return Err(ExecutorError::failed("Empty command"));
        }
        if Self::is_blocked(cmd) {
            return Err(ExecutorError::failed(format!(
                "Command contains blocked pattern: {}",
                truncate_for_error(cmd)
            )));
        }

        let mut command = Command::new("sh");
        command
            .args(["-c", cmd])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Raw context is exported so scripts can read it.
        if let Some(TaskContext::Raw { text }) = request.context {
            command.env("TASK_CONTEXT", text);
        }
        command.env("TASK_SESSION_ID", request.session_id);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let started = Instant::now();
        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExecutorError::failed(format!(
                    "Failed to spawn command: {e}"
                )));
            }
            Err(_) => {
                return Err(ExecutorError::Timeout {
                    agent: self.agent.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let detail = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return Err(ExecutorError::failed(format!(
                "Command exited with code {code}: {}",
                truncate_for_error(detail)
            )));
        }

        let usage = Usage {
            duration_ms: started.elapsed().as_millis() as u64,
            step_count: 1,
            ..Default::default()
        };
        Ok(ExecutionOutput::text(truncate_output(stdout.trim_end())).with_usage(usage))
    }
}

/// Truncate output on a char boundary.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT_SIZE;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n\n... [truncated, {} bytes total]", &s[..end], s.len())
}

fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 200 {
        s.to_string()
    } else {
        let head: String = s.chars().take(200).collect();
        format!("{head}...")
    }
}
