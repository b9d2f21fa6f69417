//! Worker pool: bounded-concurrency execution of claimed tasks.
//!
//! `max_concurrent` slots each poll the store on a fixed interval. A slot
//! that claims a task runs it to completion before polling again, so the
//! slot count bounds parallel executor invocations.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{DatabaseError, ExecutorError};
use crate::executors::{ExecutionOutput, ExecutionRequest, ExecutorRegistry};
use crate::store::TaskStore;
use crate::tasks::{Task, TaskStatus};
use crate::worker::reclaimer;

/// What happened to a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Attempt failed; requeued to run again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Attempts exhausted.
    Failed,
    /// The task left this worker's lease while executing (cancelled or
    /// reclaimed); the result was dropped.
    Discarded,
}

/// One processed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub task_id: Uuid,
    pub outcome: TaskOutcome,
}

/// Polls the store and dispatches claimed tasks to executors.
pub struct WorkerPool {
    store: Arc<dyn TaskStore>,
    executors: Arc<ExecutorRegistry>,
    config: WorkerConfig,
    instance: String,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn TaskStore>,
        executors: Arc<ExecutorRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let instance = format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]);
        Self {
            store,
            executors,
            config,
            instance,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Recover stale leases, then spawn the polling slots and (if configured)
    /// the periodic reclaimer. All loops exit when `shutdown` flips to true.
    pub async fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        reclaimer::reclaim_stale(self.store.as_ref(), self.config.stale_after).await;

        let slots = self.config.max_concurrent.max(1);
        let mut handles: Vec<JoinHandle<()>> = (0..slots)
            .map(|slot| {
                let worker_id = format!("{}-{slot}", self.instance);
                Arc::clone(&self).spawn_slot(worker_id, shutdown.clone())
            })
            .collect();

        if let Some(interval) = self.config.reclaim_interval {
            handles.push(reclaimer::spawn_reclaimer(
                Arc::clone(&self.store),
                self.config.stale_after,
                interval,
                shutdown,
            ));
        }

        info!(
            slots,
            poll_ms = self.config.poll_interval.as_millis() as u64,
            "Worker pool started"
        );
        handles
    }

    fn spawn_slot(self: Arc<Self>, worker_id: String, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(worker_id = %worker_id, "Worker slot started");
            let mut tick = tokio::time::interval(self.config.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                if let Err(e) = self.process_next(&worker_id).await {
                    error!(worker_id = %worker_id, error = %e, "Worker tick failed");
                }
            }
            debug!(worker_id = %worker_id, "Worker slot stopped");
        })
    }

    /// Claim and run at most one task as `worker_id`.
    ///
    /// Executor errors and panics are absorbed into the task's state; only
    /// store failures are returned.
    pub async fn process_next(&self, worker_id: &str) -> Result<Option<Processed>, DatabaseError> {
        let Some(task) = self.store.claim_next_pending(worker_id).await? else {
            return Ok(None);
        };

        info!(
            task_id = %task.id,
            agent = %task.agent,
            attempt = task.attempt_count,
            max_attempts = task.max_attempts,
            worker_id,
            "Running task"
        );

        let started = Instant::now();
        let outcome = match self.execute(&task).await {
            Ok(result) => self.record_success(&task, worker_id, result, started).await?,
            Err(e) => self.record_failure(&task, worker_id, &e).await?,
        };

        Ok(Some(Processed {
            task_id: task.id,
            outcome,
        }))
    }

    async fn execute(&self, task: &Task) -> Result<ExecutionOutput, ExecutorError> {
        let executor = self.executors.resolve(&task.agent).await?;
        let request = ExecutionRequest::from_task(task);

        match AssertUnwindSafe(executor.execute(request)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::Panicked {
                agent: task.agent.clone(),
            }),
        }
    }

    async fn record_success(
        &self,
        task: &Task,
        worker_id: &str,
        result: ExecutionOutput,
        started: Instant,
    ) -> Result<TaskOutcome, DatabaseError> {
        let applied = self
            .store
            .mark_completed(task.id, worker_id, &result.output, result.usage.as_ref())
            .await?;

        if !applied {
            warn!(task_id = %task.id, worker_id, "Task left this worker's lease; dropping result");
            return Ok(TaskOutcome::Discarded);
        }

        info!(
            task_id = %task.id,
            agent = %task.agent,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Task completed"
        );
        Ok(TaskOutcome::Completed)
    }

    async fn record_failure(
        &self,
        task: &Task,
        worker_id: &str,
        err: &ExecutorError,
    ) -> Result<TaskOutcome, DatabaseError> {
        // Re-read: the row may have been cancelled or reclaimed meanwhile.
        let current = match self.store.get_task(task.id).await? {
            Some(current) => current,
            None => return Ok(TaskOutcome::Discarded),
        };
        if current.status != TaskStatus::Running || current.worker_id.as_deref() != Some(worker_id)
        {
            warn!(
                task_id = %task.id,
                status = %current.status,
                error = %err,
                "Task left this worker's lease; ignoring failure"
            );
            return Ok(TaskOutcome::Discarded);
        }

        let attempt = current.attempt_count;
        let max = current.max_attempts;
        let message = format!("Attempt {attempt}/{max} failed: {err}");

        if attempt < max {
            let delay = self.config.retry.delay_for(attempt);
            if !self
                .store
                .requeue_for_retry(task.id, &message, delay)
                .await?
            {
                return Ok(TaskOutcome::Discarded);
            }
            warn!(
                task_id = %task.id,
                agent = %task.agent,
                attempt,
                max_attempts = max,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Task attempt failed; retrying"
            );
            Ok(TaskOutcome::Retrying { attempt, delay })
        } else {
            if !self.store.mark_failed(task.id, &message).await? {
                return Ok(TaskOutcome::Discarded);
            }
            warn!(
                task_id = %task.id,
                agent = %task.agent,
                attempts = attempt,
                error = %err,
                "Task failed permanently"
            );
            Ok(TaskOutcome::Failed)
        }
    }
}
