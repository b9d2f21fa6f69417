//! `TaskStore` trait: single async interface for task persistence.
//!
//! Every state transition is one conditional statement against the store, so
//! workers and dispatchers coordinate through the database rather than
//! in-process locks.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::tasks::{NewTask, Task, TaskFilter, TaskStats, Usage};

/// Backend-agnostic task store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ── Enqueue ─────────────────────────────────────────────────────

    /// Insert a new `pending` task.
    ///
    /// `ack_sent` is derived from the origin channel: gated channels start
    /// unacknowledged with a short notify-after grace, all others start
    /// acknowledged.
    async fn create_task(&self, new: &NewTask) -> Result<Task, DatabaseError>;

    /// Mark the orchestrator's acknowledgement as persisted for these tasks.
    /// Returns the number of rows that changed.
    async fn mark_ack_sent(&self, ids: &[Uuid]) -> Result<usize, DatabaseError>;

    // ── Execution queue ─────────────────────────────────────────────

    /// Atomically claim the oldest eligible `pending` task for `worker_id`.
    ///
    /// Eligible means `available_at <= now` and either acknowledged or older
    /// than the ack fallback window. Two concurrent callers that pick the same
    /// candidate cannot both succeed; the loser gets `None`.
    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Record a successful outcome. Applies only while `worker_id` still
    /// holds the running lease; returns false otherwise (cancelled, or
    /// reclaimed and handed to another worker).
    async fn mark_completed(
        &self,
        id: Uuid,
        worker_id: &str,
        output: &str,
        usage: Option<&Usage>,
    ) -> Result<bool, DatabaseError>;

    /// Record a permanent failure. Returns false if the task was not
    /// `pending`/`running`.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError>;

    /// Return a failed attempt to `pending`, claimable after `delay`.
    async fn requeue_for_retry(
        &self,
        id: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Cancel a `pending` or `running` task. Returns false (and changes
    /// nothing) for any other status.
    async fn cancel_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Operator retry of a permanently failed task: grants one more attempt
    /// and resets delivery state. Allowed once per task; later calls return
    /// false.
    async fn retry_task(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Return every `running` task whose lease is older than `stale` to
    /// `pending`. Attempt counts are kept.
    async fn recover_stale_running(&self, stale: Duration) -> Result<usize, DatabaseError>;

    // ── Notification queue ──────────────────────────────────────────

    /// Atomically claim the oldest finished task awaiting delivery, moving it
    /// to `sending` and counting the attempt.
    async fn claim_next_notification_candidate(
        &self,
        min_finished_age: Duration,
    ) -> Result<Option<Task>, DatabaseError>;

    /// Delivery succeeded.
    async fn mark_notification_sent(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Delivery failed. `Some(delay)` returns the row to `pending` after the
    /// delay; `None` parks it in `failed`.
    async fn mark_notification_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<bool, DatabaseError>;

    /// Return rows stuck in `sending` longer than `stale_sending`, and
    /// `failed` rows still under `max_attempts`, to `pending`.
    async fn recover_notification_queue(
        &self,
        max_attempts: u32,
        stale_sending: Duration,
    ) -> Result<usize, DatabaseError>;

    // ── Queries ─────────────────────────────────────────────────────

    /// Get a task by ID.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError>;

    /// List tasks, newest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError>;

    /// Per-status counts.
    async fn stats(&self) -> Result<TaskStats, DatabaseError>;
}
