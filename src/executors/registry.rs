//! Executor registry: agent tag → implementation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ExecutorError;
use crate::executors::Executor;

/// Registry of available executors.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn Executor>>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Register an executor, replacing any previous one for the same tag.
    pub async fn register(&self, executor: Arc<dyn Executor>) {
        let agent = executor.agent().to_string();
        if self
            .executors
            .write()
            .await
            .insert(agent.clone(), executor)
            .is_some()
        {
            tracing::warn!(agent = %agent, "Replaced existing executor");
        }
        tracing::debug!("Registered executor: {}", agent);
    }

    /// Register an executor (sync version for startup).
    pub fn register_sync(&self, executor: Arc<dyn Executor>) {
        let agent = executor.agent().to_string();
        if let Ok(mut executors) = self.executors.try_write() {
            executors.insert(agent.clone(), executor);
            tracing::debug!("Registered executor: {}", agent);
        }
    }

    /// Get an executor by agent tag.
    pub async fn get(&self, agent: &str) -> Option<Arc<dyn Executor>> {
        self.executors.read().await.get(agent).cloned()
    }

    /// Like [`get`](Self::get), but an unknown tag is an execution error.
    pub async fn resolve(&self, agent: &str) -> Result<Arc<dyn Executor>, ExecutorError> {
        self.get(agent).await.ok_or_else(|| ExecutorError::Unregistered {
            agent: agent.to_string(),
        })
    }

    /// Registered agent tags, sorted.
    pub async fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self.executors.read().await.keys().cloned().collect();
        agents.sort();
        agents
    }

    pub async fn count(&self) -> usize {
        self.executors.read().await.len()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
