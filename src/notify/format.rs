//! Notification text for finished tasks.

use crate::tasks::{Task, TaskStatus};

/// Longest body included in a notification; the full text stays in the store.
const MAX_BODY_CHARS: usize = 8000;

/// Render the message delivered to the task's origin channel.
pub fn render(task: &Task) -> String {
    let short = task.short_id();
    match task.status {
        TaskStatus::Completed => {
            let output = task.output.as_deref().unwrap_or("").trim();
            if output.is_empty() {
                format!("✅ Task {short} ({}) completed with no output.", task.agent)
            } else {
                format!(
                    "✅ Task {short} ({}) completed:\n\n{}",
                    task.agent,
                    clip(output)
                )
            }
        }
        TaskStatus::Failed => {
            let error = task.error.as_deref().unwrap_or("unknown error");
            format!(
                "❌ Task {short} ({}) failed after {} attempt{}:\n\n{}",
                task.agent,
                task.attempt_count,
                if task.attempt_count == 1 { "" } else { "s" },
                clip(error)
            )
        }
        other => format!("Task {short} ({}) is {other}.", task.agent),
    }
}

fn clip(text: &str) -> String {
    if text.chars().count() <= MAX_BODY_CHARS {
        return text.to_string();
    }
    let head: String = text.chars().take(MAX_BODY_CHARS).collect();
    format!("{head}\n… (truncated)")
}
