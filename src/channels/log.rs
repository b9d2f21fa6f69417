//! Log notifier: for channels whose caller polls for results (api, ui,
//! webhook, cli). Delivery is a structured log line.

use async_trait::async_trait;

use crate::channels::Notifier;
use crate::error::ChannelError;
use crate::tasks::Routing;

pub struct LogNotifier {
    name: String,
}

impl LogNotifier {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, routing: &Routing, text: &str) -> Result<(), ChannelError> {
        tracing::info!(
            channel = %self.name,
            session_id = %routing.session_id,
            user_id = routing.origin_user_id.as_deref().unwrap_or("-"),
            "{text}"
        );
        Ok(())
    }
}
