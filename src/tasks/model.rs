//! Task data model: the delegated unit of work and its two state machines.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attempts granted to a task when the caller does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Channels that render acknowledgement and result on one ordered surface.
///
/// Tasks originating here start with `ack_sent = false`.
pub const ACK_GATED_CHANNELS: &[&str] = &["telegram", "discord", "slack", "whatsapp"];

/// Whether tasks from this channel must wait for the orchestrator's acknowledgement.
pub fn requires_ack_ordering(channel: &str) -> bool {
    ACK_GATED_CHANNELS
        .iter()
        .any(|c| c.eq_ignore_ascii_case(channel))
}

/// Execution lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled tasks are never executed again
    /// unless an operator calls `retry_task`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Result-delivery status, independent of [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyStatus {
    Pending,
    Sending,
    Sent,
    Failed,
}

impl NotifyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for NotifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotifyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown notify status '{other}'")),
        }
    }
}

/// Extra input handed to the executor alongside the instruction.
///
/// Persisted as tagged JSON in the `context` column and decoded once when the
/// row is read, so executors never parse it themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskContext {
    /// Run a named skill.
    Skill { name: String },
    /// Target a named remote executor host.
    Smith { name: String },
    /// Free-form text passed through unchanged.
    Raw { text: String },
}

impl TaskContext {
    pub fn raw(text: impl Into<String>) -> Self {
        Self::Raw { text: text.into() }
    }

    /// Serialize for the `context` column.
    pub fn encode(&self) -> String {
        // A tagged enum of strings always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a stored column value. Text that is not a tagged object is
    /// treated as raw context.
    pub fn decode(stored: &str) -> Self {
        serde_json::from_str(stored).unwrap_or_else(|_| Self::raw(stored))
    }
}

/// Where a task came from and where its outcome must be delivered.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Routing {
    pub origin_channel: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_user_id: Option<String>,
}

impl Routing {
    pub fn new(origin_channel: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            origin_channel: origin_channel.into(),
            session_id: session_id.into(),
            origin_message_id: None,
            origin_user_id: None,
        }
    }
}

/// Execution telemetry reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub step_count: u32,
}

/// A persisted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Tag of the executor that must run this task.
    pub agent: String,
    pub status: TaskStatus,
    /// Natural-language instruction.
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub routing: Routing,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Earliest time the task may be claimed.
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// First claim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent claim; the lease is measured from here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub notify_status: NotifyStatus,
    pub notify_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_after_at: Option<DateTime<Utc>>,
    pub ack_sent: bool,
    /// Set once an operator has re-queued this task after it failed.
    #[serde(default)]
    pub operator_retried: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Task {
    /// Attempts left before the task fails permanently.
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }

    /// First eight characters of the id, for chat output.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}

/// Request to enqueue a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub agent: String,
    pub input: String,
    #[serde(default)]
    pub context: Option<TaskContext>,
    #[serde(flatten)]
    pub routing: Routing,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(
        agent: impl Into<String>,
        input: impl Into<String>,
        origin_channel: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            agent: agent.into(),
            input: input.into(),
            context: None,
            routing: Routing::new(origin_channel, session_id),
            max_attempts: None,
        }
    }

    /// Builder: set the executor context.
    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Builder: set the originating message.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.routing.origin_message_id = Some(message_id.into());
        self
    }

    /// Builder: set the originating user.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.routing.origin_user_id = Some(user_id.into());
        self
    }

    /// Builder: override the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Attempt budget after defaults, never below one.
    pub fn effective_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1)
    }
}

/// Filters for administrative listing. All fields are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub origin_channel: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
}

/// Aggregate task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Finished tasks whose outcome is still waiting for delivery.
    pub notify_pending: u64,
    /// Deliveries parked after exhausting their attempts.
    pub notify_failed: u64,
}

impl TaskStats {
    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub(crate) fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }
}
