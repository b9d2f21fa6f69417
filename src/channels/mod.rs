//! Outbound channels: delivering task outcomes to where the request came from.

pub mod log;
pub mod telegram;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::ChannelError;
use crate::tasks::Routing;

pub use log::LogNotifier;
pub use telegram::TelegramNotifier;

/// Sends text to one channel.
///
/// Implementations must return an error on any delivery failure so the
/// dispatcher can retry.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Channel name, matched against `Task::routing.origin_channel`.
    fn name(&self) -> &str;

    async fn send_message(&self, routing: &Routing, text: &str) -> Result<(), ChannelError>;
}

/// Channel name → notifier. Names are matched case-insensitively.
pub struct NotifierRegistry {
    notifiers: RwLock<HashMap<String, Arc<dyn Notifier>>>,
}

impl NotifierRegistry {
    pub fn new() -> Self {
        Self {
            notifiers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, notifier: Arc<dyn Notifier>) {
        let name = notifier.name().to_lowercase();
        self.notifiers.write().await.insert(name.clone(), notifier);
        tracing::debug!("Registered notifier: {}", name);
    }

    pub async fn get(&self, channel: &str) -> Option<Arc<dyn Notifier>> {
        self.notifiers
            .read()
            .await
            .get(&channel.to_lowercase())
            .cloned()
    }

    /// Like [`get`](Self::get), but a missing channel is a delivery error.
    pub async fn resolve(&self, channel: &str) -> Result<Arc<dyn Notifier>, ChannelError> {
        self.get(channel)
            .await
            .ok_or_else(|| ChannelError::NotRegistered {
                name: channel.to_string(),
            })
    }

    /// Registered channel names, sorted.
    pub async fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.notifiers.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for NotifierRegistry {
    fn default() -> Self {
        Self::new()
    }
}
