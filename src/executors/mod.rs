//! Executors: the pluggable components that do a task's actual work.
//!
//! Each executor serves one agent tag. The worker pool resolves the tag
//! through an [`ExecutorRegistry`] when it claims a task.

pub mod registry;
pub mod shell;

use async_trait::async_trait;

use crate::error::ExecutorError;
use crate::tasks::{Routing, Task, TaskContext, Usage};

pub use registry::ExecutorRegistry;
pub use shell::ShellExecutor;

/// Everything an executor sees about the task it is running.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub input: &'a str,
    pub context: Option<&'a TaskContext>,
    pub session_id: &'a str,
    pub routing: &'a Routing,
}

impl<'a> ExecutionRequest<'a> {
    pub fn from_task(task: &'a Task) -> Self {
        Self {
            input: &task.input,
            context: task.context.as_ref(),
            session_id: &task.routing.session_id,
            routing: &task.routing,
        }
    }
}

/// Result of a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub output: String,
    pub usage: Option<Usage>,
}

impl ExecutionOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Runs tasks for one agent tag.
///
/// A retried task re-runs the full instruction, so implementations must
/// tolerate being invoked again for the same input. The pool imposes no
/// timeout of its own; executors bound their own runtime.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Agent tag this executor serves.
    fn agent(&self) -> &str;

    /// Run one attempt. The error's message is what the user eventually sees.
    async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionOutput, ExecutorError>;
}
