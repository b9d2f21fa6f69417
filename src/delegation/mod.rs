//! Per-turn delegation gate.
//!
//! The orchestrator creates one `DelegationLedger` per turn and routes every
//! delegation request through it. Repeat requests for the same agent and
//! instruction collapse onto the first task, and a counter caps how many new
//! tasks one turn may create.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::DelegationError;
use crate::store::TaskStore;
use crate::tasks::{NewTask, Task};

/// Default cap on new tasks per turn.
pub const DEFAULT_MAX_DELEGATIONS: usize = 5;

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static TRAILING_PUNCT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s.!?;,:]+$").unwrap());

/// Canonical form of an instruction for duplicate detection.
///
/// Case, runs of whitespace and trailing punctuation are not significant.
pub fn normalize_input(input: &str) -> String {
    let lower = input.trim().to_lowercase();
    let collapsed = WHITESPACE.replace_all(&lower, " ");
    TRAILING_PUNCT.replace(&collapsed, "").into_owned()
}

/// Outcome of a delegation request.
#[derive(Debug, Clone)]
pub enum Delegation {
    /// A new task was enqueued.
    Created(Task),
    /// The same request was already delegated this turn.
    Duplicate(Uuid),
}

impl Delegation {
    pub fn task_id(&self) -> Uuid {
        match self {
            Self::Created(task) => task.id,
            Self::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// In-memory ledger scoped to a single orchestrator turn.
#[derive(Debug)]
pub struct DelegationLedger {
    max_per_turn: usize,
    seen: HashMap<(String, String), Uuid>,
    created: Vec<Uuid>,
    unacked: Vec<Uuid>,
}

impl DelegationLedger {
    pub fn new(max_per_turn: usize) -> Self {
        Self {
            max_per_turn,
            seen: HashMap::new(),
            created: Vec::new(),
            unacked: Vec::new(),
        }
    }

    /// Ledger capped at the configured per-turn limit.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.max_delegations)
    }

    /// Enqueue `new` unless an equivalent request was already delegated
    /// this turn, in which case the existing id is returned.
    pub async fn delegate(
        &mut self,
        store: &dyn TaskStore,
        new: NewTask,
    ) -> Result<Delegation, DelegationError> {
        if new.agent.trim().is_empty() {
            return Err(DelegationError::InvalidRequest("agent is required".into()));
        }
        if new.input.trim().is_empty() {
            return Err(DelegationError::InvalidRequest("input is required".into()));
        }

        // Agent tags resolve case-sensitively in the executor registry, so the
        // key keeps the tag exactly as it will be stored.
        let key = (new.agent.clone(), normalize_input(&new.input));
        if let Some(existing) = self.seen.get(&key) {
            debug!(task_id = %existing, agent = %new.agent, "Duplicate delegation collapsed");
            return Ok(Delegation::Duplicate(*existing));
        }

        if self.created.len() >= self.max_per_turn {
            warn!(
                max = self.max_per_turn,
                agent = %new.agent,
                "Delegation limit reached for this turn"
            );
            return Err(DelegationError::LimitReached {
                max: self.max_per_turn,
            });
        }

        let task = store.create_task(&new).await?;
        self.seen.insert(key, task.id);
        self.created.push(task.id);
        if !task.ack_sent {
            self.unacked.push(task.id);
        }

        info!(
            task_id = %task.id,
            agent = %task.agent,
            channel = %task.routing.origin_channel,
            "Task delegated"
        );
        Ok(Delegation::Created(task))
    }

    /// Record that this turn's acknowledgement message has been persisted,
    /// releasing any gated tasks it created. Safe to call more than once.
    pub async fn acknowledge(&mut self, store: &dyn TaskStore) -> Result<usize, DelegationError> {
        if self.unacked.is_empty() {
            return Ok(0);
        }
        let released = store.mark_ack_sent(&self.unacked).await?;
        debug!(count = released, "Acknowledged delegated tasks");
        self.unacked.clear();
        Ok(released)
    }

    /// Ids of tasks created this turn, in creation order.
    pub fn created(&self) -> &[Uuid] {
        &self.created
    }

    /// New delegations still allowed this turn.
    pub fn remaining(&self) -> usize {
        self.max_per_turn.saturating_sub(self.created.len())
    }
}

impl Default for DelegationLedger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DELEGATIONS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::TaskStatus;

    #[test]
    fn normalize_ignores_case_space_and_punctuation() {
        assert_eq!(normalize_input("  Check   disk\tusage!! "), "check disk usage");
        assert_eq!(normalize_input("check disk usage."), "check disk usage");
        assert_eq!(normalize_input("what's up?"), "what's up");
        assert_ne!(normalize_input("check disk"), normalize_input("check disks"));
    }

    #[tokio::test]
    async fn duplicate_returns_existing_id() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut ledger = DelegationLedger::new(5);

        let first = ledger
            .delegate(&store, NewTask::new("shell", "Check disk usage", "api", "s1"))
            .await
            .unwrap();
        let second = ledger
            .delegate(&store, NewTask::new("shell", "check  disk usage.", "api", "s1"))
            .await
            .unwrap();

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.task_id(), second.task_id());
        assert_eq!(ledger.created().len(), 1);

        let all = store.list_tasks(&Default::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn same_input_different_agent_is_distinct() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut ledger = DelegationLedger::default();

        let a = ledger
            .delegate(&store, NewTask::new("shell", "report", "api", "s1"))
            .await
            .unwrap();
        let b = ledger
            .delegate(&store, NewTask::new("dba", "report", "api", "s1"))
            .await
            .unwrap();
        assert_ne!(a.task_id(), b.task_id());
    }

    #[tokio::test]
    async fn agent_tag_is_case_sensitive() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut ledger = DelegationLedger::default();

        let lower = ledger
            .delegate(&store, NewTask::new("shell", "uptime", "api", "s1"))
            .await
            .unwrap();
        let upper = ledger
            .delegate(&store, NewTask::new("Shell", "uptime", "api", "s1"))
            .await
            .unwrap();

        assert!(!upper.is_duplicate());
        assert_ne!(lower.task_id(), upper.task_id());
        match upper {
            Delegation::Created(task) => assert_eq!(task.agent, "Shell"),
            Delegation::Duplicate(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn from_config_uses_configured_cap() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let config = QueueConfig {
            max_delegations: 1,
            ..QueueConfig::default()
        };
        let mut ledger = DelegationLedger::from_config(&config);
        assert_eq!(ledger.remaining(), 1);

        ledger
            .delegate(&store, NewTask::new("shell", "one", "api", "s1"))
            .await
            .unwrap();
        let err = ledger
            .delegate(&store, NewTask::new("shell", "two", "api", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::LimitReached { max: 1 }));
    }

    #[tokio::test]
    async fn limit_caps_new_tasks_but_not_duplicates() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut ledger = DelegationLedger::new(2);

        ledger
            .delegate(&store, NewTask::new("shell", "one", "api", "s1"))
            .await
            .unwrap();
        ledger
            .delegate(&store, NewTask::new("shell", "two", "api", "s1"))
            .await
            .unwrap();
        assert_eq!(ledger.remaining(), 0);

        let err = ledger
            .delegate(&store, NewTask::new("shell", "three", "api", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::LimitReached { max: 2 }));

        // A repeat of an earlier request is still answered.
        let dup = ledger
            .delegate(&store, NewTask::new("shell", "One", "api", "s1"))
            .await
            .unwrap();
        assert!(dup.is_duplicate());
    }

    #[tokio::test]
    async fn empty_request_rejected() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut ledger = DelegationLedger::default();
        let err = ledger
            .delegate(&store, NewTask::new("shell", "   ", "api", "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DelegationError::InvalidRequest(_)));
        assert!(ledger.created().is_empty());
    }

    #[tokio::test]
    async fn acknowledge_releases_gated_tasks() {
        let store = LibSqlBackend::new_memory().await.unwrap();
        let mut ledger = DelegationLedger::default();

        let delegated = ledger
            .delegate(&store, NewTask::new("shell", "uptime", "telegram", "chat-1"))
            .await
            .unwrap();
        assert!(store.claim_next_pending("w").await.unwrap().is_none());

        assert_eq!(ledger.acknowledge(&store).await.unwrap(), 1);
        assert_eq!(ledger.acknowledge(&store).await.unwrap(), 0);

        let claimed = store.claim_next_pending("w").await.unwrap().unwrap();
        assert_eq!(claimed.id, delegated.task_id());
        assert_eq!(claimed.status, TaskStatus::Running);
    }
}
