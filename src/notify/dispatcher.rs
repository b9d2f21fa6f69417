//! Notification dispatcher: delivers finished tasks' outcomes.
//!
//! Runs independently of the worker pool against the same store. Each tick
//! claims up to `batch_size` candidates (claim moves them to `sending`),
//! renders and sends them, then records the result. A recovery sweep returns
//! rows stuck in `sending` to the queue, so delivery is at-least-once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::NotifierRegistry;
use crate::config::NotifyConfig;
use crate::error::{ChannelError, DatabaseError};
use crate::notify::format;
use crate::store::TaskStore;

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Failed; eligible again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Parked in `notify_status = failed`.
    Quarantined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub task_id: Uuid,
    pub outcome: DeliveryOutcome,
}

pub struct NotificationDispatcher {
    store: Arc<dyn TaskStore>,
    notifiers: Arc<NotifierRegistry>,
    config: NotifyConfig,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        notifiers: Arc<NotifierRegistry>,
        config: NotifyConfig,
    ) -> Self {
        Self {
            store,
            notifiers,
            config,
        }
    }

    /// Claim and deliver at most one notification.
    pub async fn process_next(&self) -> Result<Option<Delivery>, DatabaseError> {
        let Some(task) = self
            .store
            .claim_next_notification_candidate(self.config.min_finished_age)
            .await?
        else {
            return Ok(None);
        };

        let text = format::render(&task);
        let channel = &task.routing.origin_channel;
        let sent = match self.notifiers.resolve(channel).await {
            Ok(notifier) => {
                let timeout = self.config.send_timeout;
                tokio::time::timeout(timeout, notifier.send_message(&task.routing, &text))
                    .await
                    .unwrap_or_else(|_| {
                        Err(ChannelError::Timeout {
                            name: channel.clone(),
                            timeout,
                        })
                    })
            }
            Err(e) => Err(e),
        };

        let attempt = task.notify_attempts;
        let outcome = match sent {
            Ok(()) => {
                self.store.mark_notification_sent(task.id).await?;
                info!(
                    task_id = %task.id,
                    channel = %channel,
                    status = %task.status,
                    "Notification sent"
                );
                DeliveryOutcome::Sent
            }
            Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                let delay = self.config.retry.delay_for(attempt);
                self.store
                    .mark_notification_failed(task.id, &e.to_string(), Some(delay))
                    .await?;
                warn!(
                    task_id = %task.id,
                    channel = %channel,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Notification failed; will retry"
                );
                DeliveryOutcome::Retrying { attempt, delay }
            }
            Err(e) => {
                self.store
                    .mark_notification_failed(task.id, &e.to_string(), None)
                    .await?;
                warn!(
                    task_id = %task.id,
                    channel = %channel,
                    attempt,
                    error = %e,
                    "Notification quarantined"
                );
                DeliveryOutcome::Quarantined
            }
        };

        Ok(Some(Delivery {
            task_id: task.id,
            outcome,
        }))
    }

    /// Deliver until the queue is empty or `batch_size` is reached.
    pub async fn run_batch(&self) -> Result<usize, DatabaseError> {
        let mut processed = 0;
        while processed < self.config.batch_size.max(1) {
            match self.process_next().await? {
                Some(_) => processed += 1,
                None => break,
            }
        }
        Ok(processed)
    }

    /// Return stuck or retryable rows to `pending`. Store failures are logged.
    pub async fn recover(&self) -> usize {
        match self
            .store
            .recover_notification_queue(self.config.max_attempts, self.config.stale_sending)
            .await
        {
            Ok(0) => 0,
            Ok(count) => {
                info!(count, "Recovered notification queue rows");
                count
            }
            Err(e) => {
                warn!(error = %e, "Notification recovery sweep failed");
                0
            }
        }
    }

    /// Recover once, then poll until `shutdown` flips to true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_ms = self.config.poll_interval.as_millis() as u64,
                max_attempts = self.config.max_attempts,
                "Notification dispatcher started"
            );
            self.recover().await;

            let mut tick = tokio::time::interval(self.config.poll_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_recovery = Instant::now();

            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }

                if let Err(e) = self.run_batch().await {
                    error!(error = %e, "Notification tick failed");
                }
                if last_recovery.elapsed() >= self.config.recover_interval {
                    self.recover().await;
                    last_recovery = Instant::now();
                }
            }
            debug!("Notification dispatcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::channels::Notifier;
    use crate::store::LibSqlBackend;
    use crate::tasks::{NewTask, NotifyStatus, Routing, Task};
    use crate::worker::RetryPolicy;

    /// Records messages; fails the first `failures` sends.
    struct Recorder {
        name: &'static str,
        failures: AtomicU32,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl Recorder {
        fn new(name: &'static str, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                name,
                failures: AtomicU32::new(failures),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn send_message(&self, routing: &Routing, text: &str) -> Result<(), ChannelError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ChannelError::SendFailed {
                    name: self.name.into(),
                    reason: "502 Bad Gateway".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((routing.session_id.clone(), text.to_string()));
            Ok(())
        }
    }

    /// Never answers.
    struct Silent;

    #[async_trait]
    impl Notifier for Silent {
        fn name(&self) -> &str {
            "api"
        }

        async fn send_message(&self, _routing: &Routing, _text: &str) -> Result<(), ChannelError> {
            std::future::pending().await
        }
    }

    fn config(max_attempts: u32) -> NotifyConfig {
        NotifyConfig {
            max_attempts,
            retry: RetryPolicy::new(Duration::ZERO, Duration::ZERO),
            ..Default::default()
        }
    }

    async fn completed(store: &LibSqlBackend, channel: &str, output: &str) -> Task {
        let task = store
            .create_task(&NewTask::new("shell", "q", channel, "s1"))
            .await
            .unwrap();
        store.claim_next_pending("w").await.unwrap();
        store.mark_completed(task.id, "w", output, None).await.unwrap();
        task
    }

    async fn setup(
        notifier: Arc<Recorder>,
        max_attempts: u32,
    ) -> (Arc<LibSqlBackend>, NotificationDispatcher) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(NotifierRegistry::new());
        registry.register(notifier).await;
        let dispatcher = NotificationDispatcher::new(store.clone(), registry, config(max_attempts));
        (store, dispatcher)
    }

    #[tokio::test]
    async fn delivers_completed_output() {
        let recorder = Recorder::new("api", 0);
        let (store, dispatcher) = setup(recorder.clone(), 5).await;
        let task = completed(&store, "api", "42").await;

        let delivery = dispatcher.process_next().await.unwrap().unwrap();
        assert_eq!(delivery.task_id, task.id);
        assert_eq!(delivery.outcome, DeliveryOutcome::Sent);

        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "s1");
        assert!(sent[0].1.contains("42"));

        let done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.notify_status, NotifyStatus::Sent);
        assert!(dispatcher.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_delivery_is_retried_until_sent() {
        let recorder = Recorder::new("api", 1);
        let (store, dispatcher) = setup(recorder.clone(), 5).await;
        let task = completed(&store, "api", "42").await;

        let first = dispatcher.process_next().await.unwrap().unwrap();
        assert!(matches!(
            first.outcome,
            DeliveryOutcome::Retrying { attempt: 1, .. }
        ));
        let between = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(between.notify_status, NotifyStatus::Pending);
        assert!(between.notify_last_error.unwrap().contains("502"));

        let second = dispatcher.process_next().await.unwrap().unwrap();
        assert_eq!(second.outcome, DeliveryOutcome::Sent);

        let done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.notify_status, NotifyStatus::Sent);
        assert_eq!(done.notify_attempts, 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_are_quarantined() {
        let recorder = Recorder::new("api", u32::MAX);
        let (store, dispatcher) = setup(recorder, 2).await;
        let task = completed(&store, "api", "42").await;

        let first = dispatcher.process_next().await.unwrap().unwrap();
        assert!(matches!(first.outcome, DeliveryOutcome::Retrying { .. }));
        let second = dispatcher.process_next().await.unwrap().unwrap();
        assert_eq!(second.outcome, DeliveryOutcome::Quarantined);

        let parked = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(parked.notify_status, NotifyStatus::Failed);
        // At the cap, the sweep leaves it parked.
        assert_eq!(dispatcher.recover().await, 0);
        assert!(dispatcher.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hung_delivery_times_out_and_is_retried() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(NotifierRegistry::new());
        registry.register(Arc::new(Silent)).await;
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            registry,
            NotifyConfig {
                send_timeout: Duration::from_millis(50),
                ..config(5)
            },
        );
        let task = completed(&store, "api", "42").await;

        let delivery = tokio::time::timeout(Duration::from_secs(5), dispatcher.process_next())
            .await
            .expect("delivery must be bounded")
            .unwrap()
            .unwrap();
        assert!(matches!(
            delivery.outcome,
            DeliveryOutcome::Retrying { attempt: 1, .. }
        ));

        let row = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(row.notify_status, NotifyStatus::Pending);
        assert!(row.notify_last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_channel_is_quarantined_at_once() {
        let (store, dispatcher) = setup(Recorder::new("api", 0), 5).await;
        let task = completed(&store, "fax", "42").await;

        let delivery = dispatcher.process_next().await.unwrap().unwrap();
        assert_eq!(delivery.outcome, DeliveryOutcome::Quarantined);
        let parked = store.get_task(task.id).await.unwrap().unwrap();
        assert!(
            parked
                .notify_last_error
                .unwrap()
                .contains("No notifier registered")
        );
    }

    #[tokio::test]
    async fn failures_are_delivered_too() {
        let recorder = Recorder::new("api", 0);
        let (store, dispatcher) = setup(recorder.clone(), 5).await;
        let task = store
            .create_task(&NewTask::new("shell", "q", "api", "s1"))
            .await
            .unwrap();
        store.claim_next_pending("w").await.unwrap();
        store
            .mark_failed(task.id, "Attempt 1/1 failed: boom")
            .await
            .unwrap();

        dispatcher.process_next().await.unwrap().unwrap();
        let sent = recorder.sent.lock().unwrap().clone();
        assert!(sent[0].1.contains("Attempt 1/1 failed: boom"));
    }

    #[tokio::test]
    async fn batch_respects_size() {
        let recorder = Recorder::new("api", 0);
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(NotifierRegistry::new());
        registry.register(recorder.clone()).await;
        let dispatcher = NotificationDispatcher::new(
            store.clone(),
            registry,
            NotifyConfig {
                batch_size: 2,
                ..config(5)
            },
        );
        for i in 0..3 {
            completed(&store, "api", &format!("r{i}")).await;
        }

        assert_eq!(dispatcher.run_batch().await.unwrap(), 2);
        assert_eq!(dispatcher.run_batch().await.unwrap(), 1);
        assert_eq!(dispatcher.run_batch().await.unwrap(), 0);
        assert_eq!(recorder.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn started_dispatcher_delivers_and_stops() {
        let recorder = Recorder::new("api", 0);
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let registry = Arc::new(NotifierRegistry::new());
        registry.register(recorder.clone()).await;
        let dispatcher = Arc::new(NotificationDispatcher::new(
            store.clone(),
            registry,
            NotifyConfig {
                poll_interval: Duration::from_millis(10),
                ..config(5)
            },
        ));
        completed(&store, "api", "42").await;

        let (tx, rx) = watch::channel(false);
        let handle = dispatcher.start(rx);

        for _ in 0..200 {
            if !recorder.sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
