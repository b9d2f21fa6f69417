//! libSQL backend: async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. A claim is one UPDATE that
//! picks its row with a subquery and re-checks the full eligibility predicate
//! on that row, so the loser of a race sees no returned id.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::requires_ack_ordering;
use crate::tasks::{
    NewTask, NotifyStatus, Routing, Task, TaskContext, TaskFilter, TaskStats, TaskStatus, Usage,
};

/// Error text written on tasks returned to the queue by the stale-lease sweep.
pub const STALE_RECOVERY_NOTE: &str = "Recovered after worker lease went stale";

/// A task a worker may claim now (`?2` = now, `?3` = ack fallback cutoff).
const CLAIMABLE_TASK: &str =
    "status = 'pending' AND available_at <= ?2 AND (ack_sent = 1 OR created_at <= ?3)";

/// A finished task whose outcome may be delivered now
/// (`?1` = finished cutoff, `?2` = now, `?3` = ack fallback cutoff).
const DELIVERABLE_TASK: &str = "status IN ('completed', 'failed') AND notify_status = 'pending'
    AND finished_at <= ?1
    AND (notify_after_at IS NULL OR notify_after_at <= ?2)
    AND (ack_sent = 1 OR created_at <= ?3)";

/// Default and maximum page size for `list_tasks`.
const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

/// Ack-gating timings applied by the store.
#[derive(Debug, Clone, Copy)]
pub struct StoreTuning {
    /// An unacknowledged task becomes claimable anyway once it is this old.
    pub ack_fallback: Duration,
    /// Delay before a gated task's outcome may be delivered.
    pub ack_grace: Duration,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            ack_fallback: Duration::from_secs(15),
            ack_grace: Duration::from_millis(1500),
        }
    }
}

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    tuning: StoreTuning,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        migrations::run_migrations(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            conn,
            tuning: StoreTuning::default(),
        })
    }

    /// Builder: override ack-gating timings.
    pub fn with_tuning(mut self, tuning: StoreTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a claiming `UPDATE ... RETURNING id` and return the claimed id.
    async fn claim_returning_id(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let id = match rows.next().await {
            Ok(Some(row)) => Some(
                row.get::<String>(0)
                    .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?,
            ),
            Ok(None) => None,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        };
        // Step the statement to completion so the write commits before returning.
        while let Ok(Some(_)) = rows.next().await {}
        Ok(id)
    }

    /// Fetch a row that a conditional update just claimed.
    async fn fetch_claimed(&self, id: &str) -> Result<Task, DatabaseError> {
        let uuid = Uuid::parse_str(id)
            .map_err(|e| DatabaseError::Serialization(format!("task.id parse: {e}")))?;
        self.get_task(uuid).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "task".into(),
            id: id.to_string(),
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert a duration to whole milliseconds, saturating.
fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn get_text(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("task.{name}: {e}")))
}

fn get_int(row: &libsql::Row, idx: i32, name: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("task.{name}: {e}")))
}

fn opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn opt_time(row: &libsql::Row, idx: i32) -> Option<DateTime<Utc>> {
    row.get::<i64>(idx).ok().map(ms_to_datetime)
}

/// Column list for task SELECT queries (33 columns).
const TASK_COLUMNS: &str = "id, agent, status, input, context, output, error, origin_channel, session_id, origin_message_id, origin_user_id, attempt_count, max_attempts, available_at, created_at, started_at, claimed_at, finished_at, updated_at, worker_id, notify_status, notify_attempts, notify_last_error, notified_at, notify_after_at, ack_sent, provider, model, input_tokens, output_tokens, duration_ms, step_count, operator_retried";

/// Map a libsql Row to a Task. Column order matches `TASK_COLUMNS`.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str = get_text(row, 0, "id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.id parse: {e}")))?;

    let status: TaskStatus = get_text(row, 2, "status")?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let notify_status: NotifyStatus = get_text(row, 20, "notify_status")?
        .parse()
        .map_err(DatabaseError::Serialization)?;

    // Telemetry columns are written together on completion.
    let usage = row.get::<i64>(30).ok().map(|duration| Usage {
        provider: opt_text(row, 26),
        model: opt_text(row, 27),
        input_tokens: row.get::<i64>(28).unwrap_or(0) as u64,
        output_tokens: row.get::<i64>(29).unwrap_or(0) as u64,
        duration_ms: duration as u64,
        step_count: row.get::<i64>(31).unwrap_or(0) as u32,
    });

    Ok(Task {
        id,
        agent: get_text(row, 1, "agent")?,
        status,
        input: get_text(row, 3, "input")?,
        context: opt_text(row, 4).map(|s| TaskContext::decode(&s)),
        output: opt_text(row, 5),
        error: opt_text(row, 6),
        routing: Routing {
            origin_channel: get_text(row, 7, "origin_channel")?,
            session_id: get_text(row, 8, "session_id")?,
            origin_message_id: opt_text(row, 9),
            origin_user_id: opt_text(row, 10),
        },
        attempt_count: get_int(row, 11, "attempt_count")? as u32,
        max_attempts: get_int(row, 12, "max_attempts")? as u32,
        available_at: ms_to_datetime(get_int(row, 13, "available_at")?),
        created_at: ms_to_datetime(get_int(row, 14, "created_at")?),
        started_at: opt_time(row, 15),
        claimed_at: opt_time(row, 16),
        finished_at: opt_time(row, 17),
        updated_at: ms_to_datetime(get_int(row, 18, "updated_at")?),
        worker_id: opt_text(row, 19),
        notify_status,
        notify_attempts: get_int(row, 21, "notify_attempts")? as u32,
        notify_last_error: opt_text(row, 22),
        notified_at: opt_time(row, 23),
        notify_after_at: opt_time(row, 24),
        ack_sent: get_int(row, 25, "ack_sent")? != 0,
        operator_retried: get_int(row, 32, "operator_retried")? != 0,
        usage,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    // ── Enqueue ─────────────────────────────────────────────────────

    async fn create_task(&self, new: &NewTask) -> Result<Task, DatabaseError> {
        let conn = self.conn();
        let id = Uuid::new_v4();
        let now = now_ms();
        let gated = requires_ack_ordering(&new.routing.origin_channel);
        let notify_after = gated.then(|| now + duration_ms(self.tuning.ack_grace));

        conn.execute(
            "INSERT INTO tasks (id, agent, status, input, context, origin_channel, session_id, origin_message_id, origin_user_id, attempt_count, max_attempts, available_at, created_at, updated_at, notify_status, notify_attempts, notify_after_at, ack_sent)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10, ?10, ?10, 'pending', 0, ?11, ?12)",
            params![
                id.to_string(),
                new.agent.as_str(),
                new.input.as_str(),
                new.context.as_ref().map(TaskContext::encode),
                new.routing.origin_channel.as_str(),
                new.routing.session_id.as_str(),
                new.routing.origin_message_id.as_deref(),
                new.routing.origin_user_id.as_deref(),
                new.effective_max_attempts() as i64,
                now,
                notify_after,
                (!gated) as i64,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        debug!(
            task_id = %id,
            agent = %new.agent,
            channel = %new.routing.origin_channel,
            ack_gated = gated,
            "Task created"
        );

        self.get_task(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "task".into(),
            id: id.to_string(),
        })
    }

    async fn mark_ack_sent(&self, ids: &[Uuid]) -> Result<usize, DatabaseError> {
        let conn = self.conn();
        let now = now_ms();
        let mut changed = 0;
        for id in ids {
            changed += conn
                .execute(
                    "UPDATE tasks SET ack_sent = 1, updated_at = ?1 WHERE id = ?2 AND ack_sent = 0",
                    params![now, id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("mark_ack_sent: {e}")))?
                as usize;
        }
        debug!(requested = ids.len(), changed, "Ack recorded");
        Ok(changed)
    }

    // ── Execution queue ─────────────────────────────────────────────

    async fn claim_next_pending(&self, worker_id: &str) -> Result<Option<Task>, DatabaseError> {
        let now = now_ms();
        let ack_cutoff = now - duration_ms(self.tuning.ack_fallback);

        let sql = format!(
            "UPDATE tasks SET status = 'running', worker_id = ?1, attempt_count = attempt_count + 1,
                started_at = COALESCE(started_at, ?2), claimed_at = ?2, updated_at = ?2
             WHERE id = (
                 SELECT id FROM tasks WHERE {CLAIMABLE_TASK}
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1
             ) AND {CLAIMABLE_TASK}
             RETURNING id"
        );
        let Some(id) = self
            .claim_returning_id(&sql, params![worker_id, now, ack_cutoff], "claim_next_pending")
            .await?
        else {
            return Ok(None);
        };

        let task = self.fetch_claimed(&id).await?;
        debug!(
            task_id = %task.id,
            worker_id,
            attempt = task.attempt_count,
            "Task claimed"
        );
        Ok(Some(task))
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        worker_id: &str,
        output: &str,
        usage: Option<&Usage>,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'completed', output = ?1, error = NULL, finished_at = ?2, updated_at = ?2,
                    provider = ?3, model = ?4, input_tokens = ?5, output_tokens = ?6, duration_ms = ?7, step_count = ?8
                 WHERE id = ?9 AND status = 'running' AND worker_id = ?10",
                params![
                    output,
                    now,
                    usage.and_then(|u| u.provider.as_deref()),
                    usage.and_then(|u| u.model.as_deref()),
                    usage.map(|u| u.input_tokens as i64),
                    usage.map(|u| u.output_tokens as i64),
                    usage.map(|u| u.duration_ms as i64),
                    usage.map(|u| u.step_count as i64),
                    id.to_string(),
                    worker_id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_completed: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', error = ?1, output = NULL, finished_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status IN ('pending', 'running')",
                params![error, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        Ok(changed > 0)
    }

    async fn requeue_for_retry(
        &self,
        id: Uuid,
        error: &str,
        delay: Duration,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', error = ?1, available_at = ?2, worker_id = NULL, updated_at = ?3
                 WHERE id = ?4 AND status IN ('running', 'failed')",
                params![
                    error,
                    now.saturating_add(duration_ms(delay)),
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("requeue_for_retry: {e}")))?;
        Ok(changed > 0)
    }

    async fn cancel_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'cancelled', finished_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_task: {e}")))?;

        if changed > 0 {
            info!(task_id = %id, "Task cancelled");
        }
        Ok(changed > 0)
    }

    async fn retry_task(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', output = NULL, error = NULL, worker_id = NULL,
                    finished_at = NULL, available_at = ?1, updated_at = ?1,
                    max_attempts = attempt_count + 1, operator_retried = 1,
                    notify_status = 'pending', notify_attempts = 0, notify_last_error = NULL,
                    notified_at = NULL, notify_after_at = NULL
                 WHERE id = ?2 AND status = 'failed' AND operator_retried = 0",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("retry_task: {e}")))?;

        if changed > 0 {
            info!(task_id = %id, "Failed task re-queued by operator");
        }
        Ok(changed > 0)
    }

    async fn recover_stale_running(&self, stale: Duration) -> Result<usize, DatabaseError> {
        let now = now_ms();
        let cutoff = now - duration_ms(stale);
        let recovered = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', worker_id = NULL, error = ?1, available_at = ?2, updated_at = ?2
                 WHERE status = 'running' AND COALESCE(claimed_at, started_at) <= ?3",
                params![STALE_RECOVERY_NOTE, now, cutoff],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_stale_running: {e}")))?;
        Ok(recovered as usize)
    }

    // ── Notification queue ──────────────────────────────────────────

    async fn claim_next_notification_candidate(
        &self,
        min_finished_age: Duration,
    ) -> Result<Option<Task>, DatabaseError> {
        let now = now_ms();
        let finished_cutoff = now - duration_ms(min_finished_age);
        let ack_cutoff = now - duration_ms(self.tuning.ack_fallback);

        let sql = format!(
            "UPDATE tasks SET notify_status = 'sending', notify_attempts = notify_attempts + 1, updated_at = ?2
             WHERE id = (
                 SELECT id FROM tasks WHERE {DELIVERABLE_TASK}
                 ORDER BY finished_at ASC, rowid ASC
                 LIMIT 1
             ) AND {DELIVERABLE_TASK}
             RETURNING id"
        );
        let Some(id) = self
            .claim_returning_id(
                &sql,
                params![finished_cutoff, now, ack_cutoff],
                "claim_next_notification_candidate",
            )
            .await?
        else {
            return Ok(None);
        };

        self.fetch_claimed(&id).await.map(Some)
    }

    async fn mark_notification_sent(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET notify_status = 'sent', notified_at = ?1, notify_last_error = NULL, updated_at = ?1
                 WHERE id = ?2 AND notify_status = 'sending'
                   AND status IN ('completed', 'failed', 'cancelled')",
                params![now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_notification_sent: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_notification_failed(
        &self,
        id: Uuid,
        error: &str,
        retry_after: Option<Duration>,
    ) -> Result<bool, DatabaseError> {
        let now = now_ms();
        let result = match retry_after {
            Some(delay) => {
                self.conn()
                    .execute(
                        "UPDATE tasks SET notify_status = 'pending', notify_last_error = ?1, notify_after_at = ?2, updated_at = ?3
                         WHERE id = ?4 AND notify_status = 'sending'",
                        params![
                            error,
                            now.saturating_add(duration_ms(delay)),
                            now,
                            id.to_string()
                        ],
                    )
                    .await
            }
            None => {
                self.conn()
                    .execute(
                        "UPDATE tasks SET notify_status = 'failed', notify_last_error = ?1, updated_at = ?2
                         WHERE id = ?3 AND notify_status = 'sending'",
                        params![error, now, id.to_string()],
                    )
                    .await
            }
        };
        let changed =
            result.map_err(|e| DatabaseError::Query(format!("mark_notification_failed: {e}")))?;
        Ok(changed > 0)
    }

    async fn recover_notification_queue(
        &self,
        max_attempts: u32,
        stale_sending: Duration,
    ) -> Result<usize, DatabaseError> {
        let now = now_ms();
        let cutoff = now - duration_ms(stale_sending);
        let recovered = self
            .conn()
            .execute(
                "UPDATE tasks SET notify_status = 'pending', updated_at = ?1
                 WHERE (notify_status = 'sending' AND updated_at <= ?2)
                    OR (notify_status = 'failed' AND notify_attempts < ?3)",
                params![now, cutoff, max_attempts as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_notification_queue: {e}")))?;
        Ok(recovered as usize)
    }

    // ── Queries ─────────────────────────────────────────────────────

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE (?1 IS NULL OR status = ?1) \
                       AND (?2 IS NULL OR agent = ?2) \
                       AND (?3 IS NULL OR origin_channel = ?3) \
                       AND (?4 IS NULL OR session_id = ?4) \
                     ORDER BY created_at DESC, rowid DESC \
                     LIMIT ?5"
                ),
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.agent.as_deref(),
                    filter.origin_channel.as_deref(),
                    filter.session_id.as_deref(),
                    limit as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn stats(&self) -> Result<TaskStats, DatabaseError> {
        let conn = self.conn();
        let mut stats = TaskStats::default();

        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;
        while let Ok(Some(row)) = rows.next().await {
            let status_str: String = row.get(0).unwrap_or_default();
            let count: i64 = row.get(1).unwrap_or(0);
            if let Ok(status) = status_str.parse::<TaskStatus>() {
                stats.add(status, count as u64);
            }
        }

        let mut rows = conn
            .query(
                "SELECT
                    COALESCE(SUM(CASE WHEN status IN ('completed', 'failed') AND notify_status IN ('pending', 'sending') THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN notify_status = 'failed' THEN 1 ELSE 0 END), 0)
                 FROM tasks",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats notify: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            stats.notify_pending = row.get::<i64>(0).unwrap_or(0) as u64;
            stats.notify_failed = row.get::<i64>(1).unwrap_or(0) as u64;
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn api_task(input: &str) -> NewTask {
        NewTask::new("shell", input, "api", "session-1")
    }

    /// Backdate timestamp columns so time-based predicates can be exercised.
    async fn backdate(db: &LibSqlBackend, id: Uuid, column: &str, ago: Duration) {
        let at = now_ms() - duration_ms(ago);
        db.conn()
            .execute(
                &format!("UPDATE tasks SET {column} = ?1 WHERE id = ?2"),
                params![at, id.to_string()],
            )
            .await
            .unwrap();
    }

    // ── Create / read ───────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_get() {
        let db = test_db().await;
        let new = api_task("df -h")
            .with_context(TaskContext::Skill {
                name: "disk-report".into(),
            })
            .with_message_id("m-1")
            .with_user_id("u-1");

        let task = db.create_task(&new).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.notify_status, NotifyStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert_eq!(task.max_attempts, 3);
        assert!(task.ack_sent);
        assert!(task.notify_after_at.is_none());
        assert!(task.worker_id.is_none());

        let fetched = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.input, "df -h");
        assert_eq!(
            fetched.context,
            Some(TaskContext::Skill {
                name: "disk-report".into()
            })
        );
        assert_eq!(fetched.routing.origin_message_id.as_deref(), Some("m-1"));
        assert_eq!(fetched.routing.origin_user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn get_not_found() {
        let db = test_db().await;
        assert!(db.get_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gated_channel_starts_unacknowledged() {
        let db = test_db().await;
        let task = db
            .create_task(&NewTask::new("shell", "uptime", "telegram", "chat-9"))
            .await
            .unwrap();
        assert!(!task.ack_sent);
        let grace = task.notify_after_at.unwrap() - task.created_at;
        assert_eq!(grace.num_milliseconds(), 1500);
    }

    // ── Claim ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_stamps_lease_fields() {
        let db = test_db().await;
        let created = db.create_task(&api_task("whoami")).await.unwrap();

        let claimed = db.claim_next_pending("worker-0").await.unwrap().unwrap();
        assert_eq!(claimed.id, created.id);
        assert_eq!(claimed.status, TaskStatus::Running);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-0"));
        assert!(claimed.started_at.is_some());
        assert_eq!(claimed.started_at, claimed.claimed_at);

        assert!(db.claim_next_pending("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_oldest_first() {
        let db = test_db().await;
        let first = db.create_task(&api_task("one")).await.unwrap();
        let second = db.create_task(&api_task("two")).await.unwrap();
        backdate(&db, first.id, "created_at", Duration::from_secs(5)).await;

        assert_eq!(db.claim_next_pending("w").await.unwrap().unwrap().id, first.id);
        assert_eq!(db.claim_next_pending("w").await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let db = Arc::new(test_db().await);

        for round in 0..10 {
            let mut ids = Vec::new();
            for n in 0..3 {
                ids.push(db.create_task(&api_task(&format!("r{round}-{n}"))).await.unwrap().id);
            }

            let mut handles = Vec::new();
            for i in 0..8 {
                let db = Arc::clone(&db);
                handles.push(tokio::spawn(async move {
                    db.claim_next_pending(&format!("worker-{i}")).await.unwrap()
                }));
            }

            let mut claimed = Vec::new();
            for handle in handles {
                if let Some(task) = handle.await.unwrap() {
                    claimed.push(task.id);
                }
            }
            claimed.sort();
            let before = claimed.len();
            claimed.dedup();
            assert_eq!(claimed.len(), before, "round {round}: a task was claimed twice");
            assert_eq!(claimed.len(), 3, "round {round}");

            for id in ids {
                let task = db.get_task(id).await.unwrap().unwrap();
                assert_eq!(task.attempt_count, 1);
            }
        }
    }

    #[tokio::test]
    async fn gated_task_is_not_claimable_before_ack_or_fallback() {
        let db = test_db().await;
        let task = db
            .create_task(&NewTask::new("shell", "uptime", "telegram", "chat-1"))
            .await
            .unwrap();
        // Older than anything else so it would be picked first if eligible.
        backdate(&db, task.id, "created_at", Duration::from_secs(1)).await;
        let open = db.create_task(&api_task("open")).await.unwrap();

        let claimed = db.claim_next_pending("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, open.id);
        assert!(db.claim_next_pending("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn gated_task_waits_for_ack() {
        let db = test_db().await;
        let task = db
            .create_task(&NewTask::new("shell", "uptime", "telegram", "chat-1"))
            .await
            .unwrap();

        assert!(db.claim_next_pending("w").await.unwrap().is_none());

        assert_eq!(db.mark_ack_sent(&[task.id]).await.unwrap(), 1);
        // Second ack is a no-op.
        assert_eq!(db.mark_ack_sent(&[task.id]).await.unwrap(), 0);

        let claimed = db.claim_next_pending("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn gated_task_released_by_fallback_window() {
        let db = test_db().await;
        let task = db
            .create_task(&NewTask::new("shell", "uptime", "telegram", "chat-1"))
            .await
            .unwrap();
        assert!(db.claim_next_pending("w").await.unwrap().is_none());

        backdate(&db, task.id, "created_at", Duration::from_secs(16)).await;
        let claimed = db.claim_next_pending("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        assert!(!claimed.ack_sent);
    }

    #[tokio::test]
    async fn zero_fallback_never_blocks() {
        let db = test_db().await.with_tuning(StoreTuning {
            ack_fallback: Duration::ZERO,
            ack_grace: Duration::ZERO,
        });
        db.create_task(&NewTask::new("shell", "uptime", "telegram", "chat-1"))
            .await
            .unwrap();
        assert!(db.claim_next_pending("w").await.unwrap().is_some());
    }

    // ── Terminal transitions ────────────────────────────────────────

    #[tokio::test]
    async fn complete_records_output_and_usage() {
        let db = test_db().await;
        let task = db.create_task(&api_task("answer")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();

        let usage = Usage {
            provider: Some("anthropic".into()),
            model: Some("claude".into()),
            input_tokens: 120,
            output_tokens: 30,
            duration_ms: 950,
            step_count: 2,
        };
        assert!(db.mark_completed(task.id, "w", "42", Some(&usage)).await.unwrap());

        let done = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("42"));
        assert!(done.error.is_none());
        assert!(done.finished_at.is_some());
        assert_eq!(done.usage, Some(usage));

        // Output is write-once.
        assert!(!db.mark_completed(task.id, "w", "43", None).await.unwrap());
        assert!(!db.mark_failed(task.id, "late").await.unwrap());
    }

    #[tokio::test]
    async fn requeue_delays_and_releases_lease() {
        let db = test_db().await;
        let task = db.create_task(&api_task("flaky")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();

        assert!(
            db.requeue_for_retry(task.id, "Attempt 1/3 failed: boom", Duration::from_secs(60))
                .await
                .unwrap()
        );
        let queued = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(queued.status, TaskStatus::Pending);
        assert_eq!(queued.attempt_count, 1);
        assert!(queued.worker_id.is_none());
        assert_eq!(queued.error.as_deref(), Some("Attempt 1/3 failed: boom"));
        assert!(queued.available_at > Utc::now());

        // Not claimable until the delay elapses.
        assert!(db.claim_next_pending("w").await.unwrap().is_none());
        backdate(&db, task.id, "available_at", Duration::from_secs(1)).await;
        let again = db.claim_next_pending("w").await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 2);
    }

    #[tokio::test]
    async fn cancel_only_from_pending_or_running() {
        let db = test_db().await;
        let task = db.create_task(&api_task("long")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();

        assert!(db.cancel_task(task.id).await.unwrap());
        let cancelled = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        // Already terminal: not cancelled again, nothing changes.
        assert!(!db.cancel_task(task.id).await.unwrap());
        let unchanged = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.updated_at, cancelled.updated_at);

        // The executor finishing later cannot resurrect it.
        assert!(!db.mark_completed(task.id, "w", "done", None).await.unwrap());
        assert!(
            !db.requeue_for_retry(task.id, "x", Duration::ZERO)
                .await
                .unwrap()
        );
        assert!(!db.retry_task(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_completed_is_noop() {
        let db = test_db().await;
        let task = db.create_task(&api_task("fast")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();
        db.mark_completed(task.id, "w", "ok", None).await.unwrap();

        assert!(!db.cancel_task(task.id).await.unwrap());
        let done = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.output.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn retry_failed_grants_one_attempt() {
        let db = test_db().await;
        let task = db
            .create_task(&api_task("doomed").with_max_attempts(1))
            .await
            .unwrap();
        db.claim_next_pending("w").await.unwrap();
        db.mark_failed(task.id, "Attempt 1/1 failed: nope").await.unwrap();

        assert!(db.retry_task(task.id).await.unwrap());
        let requeued = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert!(requeued.error.is_none());
        assert!(requeued.finished_at.is_none());
        assert_eq!(requeued.max_attempts, 2);
        assert_eq!(requeued.notify_status, NotifyStatus::Pending);
        assert!(requeued.operator_retried);

        // Only failed tasks can be retried.
        assert!(!db.retry_task(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn operator_retry_is_granted_once() {
        let db = test_db().await;
        let task = db
            .create_task(&api_task("doomed").with_max_attempts(1))
            .await
            .unwrap();
        db.claim_next_pending("w").await.unwrap();
        db.mark_failed(task.id, "Attempt 1/1 failed: nope").await.unwrap();
        assert!(db.retry_task(task.id).await.unwrap());

        db.claim_next_pending("w").await.unwrap().unwrap();
        db.mark_failed(task.id, "Attempt 2/2 failed: nope").await.unwrap();
        assert!(!db.retry_task(task.id).await.unwrap());

        let parked = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(parked.status, TaskStatus::Failed);
        assert_eq!(parked.attempt_count, 2);
        assert_eq!(parked.max_attempts, 2);
    }

    // ── Recovery ────────────────────────────────────────────────────

    #[tokio::test]
    async fn stale_running_is_recovered() {
        let db = test_db().await;
        let task = db.create_task(&api_task("crashy")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();
        backdate(&db, task.id, "started_at", Duration::from_secs(600)).await;
        backdate(&db, task.id, "claimed_at", Duration::from_secs(600)).await;

        let recovered = db
            .recover_stale_running(Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let back = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(back.attempt_count, 1);
        assert!(back.worker_id.is_none());
        assert_eq!(back.error.as_deref(), Some(STALE_RECOVERY_NOTE));

        let again = db.claim_next_pending("w2").await.unwrap().unwrap();
        assert_eq!(again.attempt_count, 2);
    }

    #[tokio::test]
    async fn late_completion_after_reclaim_is_dropped() {
        let db = test_db().await;
        let task = db.create_task(&api_task("slow")).await.unwrap();
        db.claim_next_pending("w1").await.unwrap();
        backdate(&db, task.id, "claimed_at", Duration::from_secs(600)).await;
        db.recover_stale_running(Duration::from_secs(300))
            .await
            .unwrap();
        db.claim_next_pending("w2").await.unwrap().unwrap();

        assert!(!db.mark_completed(task.id, "w1", "stale", None).await.unwrap());
        let running = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.worker_id.as_deref(), Some("w2"));
        assert!(running.output.is_none());

        assert!(db.mark_completed(task.id, "w2", "fresh", None).await.unwrap());
        let done = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.output.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn fresh_lease_is_not_recovered() {
        let db = test_db().await;
        let task = db.create_task(&api_task("slow")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();
        // First claim was long ago but the current lease is fresh.
        backdate(&db, task.id, "started_at", Duration::from_secs(600)).await;

        assert_eq!(
            db.recover_stale_running(Duration::from_secs(300))
                .await
                .unwrap(),
            0
        );
    }

    // ── Notifications ───────────────────────────────────────────────

    async fn finished_task(db: &LibSqlBackend, output: &str) -> Task {
        let task = db.create_task(&api_task("work")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();
        db.mark_completed(task.id, "w", output, None).await.unwrap();
        task
    }

    #[tokio::test]
    async fn notification_claim_and_send() {
        let db = test_db().await;
        let task = finished_task(&db, "42").await;

        let claimed = db
            .claim_next_notification_candidate(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.notify_status, NotifyStatus::Sending);
        assert_eq!(claimed.notify_attempts, 1);
        assert!(
            db.claim_next_notification_candidate(Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );

        assert!(db.mark_notification_sent(task.id).await.unwrap());
        let sent = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(sent.notify_status, NotifyStatus::Sent);
        assert!(sent.notified_at.is_some());
    }

    #[tokio::test]
    async fn unfinished_tasks_are_not_notification_candidates() {
        let db = test_db().await;
        let task = db.create_task(&api_task("running")).await.unwrap();
        db.claim_next_pending("w").await.unwrap();
        assert!(
            db.claim_next_notification_candidate(Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );

        db.cancel_task(task.id).await.unwrap();
        assert!(
            db.claim_next_notification_candidate(Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn notification_min_age_and_notify_after() {
        let db = test_db().await;
        let task = finished_task(&db, "done").await;

        assert!(
            db.claim_next_notification_candidate(Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );
        backdate(&db, task.id, "finished_at", Duration::from_secs(31)).await;

        let claimed = db
            .claim_next_notification_candidate(Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        db.mark_notification_failed(claimed.id, "502", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        // notify_after_at now in the future.
        assert!(
            db.claim_next_notification_candidate(Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
        backdate(&db, task.id, "notify_after_at", Duration::from_secs(1)).await;
        let retried = db
            .claim_next_notification_candidate(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.notify_attempts, 2);
        assert_eq!(retried.notify_last_error.as_deref(), Some("502"));
    }

    #[tokio::test]
    async fn notification_failure_without_retry_is_parked() {
        let db = test_db().await;
        let task = finished_task(&db, "done").await;
        db.claim_next_notification_candidate(Duration::ZERO)
            .await
            .unwrap();

        assert!(
            db.mark_notification_failed(task.id, "gone", None)
                .await
                .unwrap()
        );
        let parked = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(parked.notify_status, NotifyStatus::Failed);
        assert!(
            db.claim_next_notification_candidate(Duration::ZERO)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn notification_recovery_sweep() {
        let db = test_db().await;
        let stuck = finished_task(&db, "a").await;
        let parked = finished_task(&db, "b").await;
        let exhausted = finished_task(&db, "c").await;

        for _ in 0..3 {
            db.claim_next_notification_candidate(Duration::ZERO)
                .await
                .unwrap();
        }
        backdate(&db, stuck.id, "updated_at", Duration::from_secs(600)).await;
        db.mark_notification_failed(parked.id, "x", None).await.unwrap();
        db.conn()
            .execute(
                "UPDATE tasks SET notify_status = 'failed', notify_attempts = 5 WHERE id = ?1",
                params![exhausted.id.to_string()],
            )
            .await
            .unwrap();

        let recovered = db
            .recover_notification_queue(5, Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(recovered, 2);

        let stuck = db.get_task(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.notify_status, NotifyStatus::Pending);
        let parked = db.get_task(parked.id).await.unwrap().unwrap();
        assert_eq!(parked.notify_status, NotifyStatus::Pending);
        let exhausted = db.get_task(exhausted.id).await.unwrap().unwrap();
        assert_eq!(exhausted.notify_status, NotifyStatus::Failed);
    }

    // ── Queries ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn list_with_filters() {
        let db = test_db().await;
        db.create_task(&NewTask::new("shell", "a", "api", "s1"))
            .await
            .unwrap();
        db.create_task(&NewTask::new("dba", "b", "api", "s2"))
            .await
            .unwrap();
        db.create_task(&NewTask::new("shell", "c", "telegram", "s1"))
            .await
            .unwrap();

        let all = db.list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let shell = db
            .list_tasks(&TaskFilter {
                agent: Some("shell".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(shell.len(), 2);

        let s1_api = db
            .list_tasks(&TaskFilter {
                origin_channel: Some("api".into()),
                session_id: Some("s1".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(s1_api.len(), 1);
        assert_eq!(s1_api[0].input, "a");

        db.claim_next_pending("w").await.unwrap();
        let running = db
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);

        let limited = db
            .list_tasks(&TaskFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let db = test_db().await;
        finished_task(&db, "done").await;
        db.create_task(&api_task("later")).await.unwrap();
        let doomed = db.create_task(&api_task("cancel me")).await.unwrap();
        db.cancel_task(doomed.id).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.notify_pending, 1);
        assert_eq!(stats.notify_failed, 0);
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("queue.db");

        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_task(&api_task("survive restart")).await.unwrap().id
        };

        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        let task = reopened.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.input, "survive restart");
        assert_eq!(task.status, TaskStatus::Pending);
    }
}
