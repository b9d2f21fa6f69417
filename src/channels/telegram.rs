//! Telegram notifier: Bot API `sendMessage` to the originating chat.
//!
//! The session id of a Telegram-originated task is the chat id. When the
//! originating message id is known the result is sent as a reply to it.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::Notifier;
use crate::error::ChannelError;
use crate::tasks::Routing;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Per-request bound on Bot API calls.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub struct TelegramNotifier {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            client: http_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    /// Point at a different Bot API server (self-hosted or test).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    /// Send a single chunk (≤4096 bytes), Markdown-first with plain fallback.
    async fn send_chunk(
        &self,
        chat_id: &str,
        reply_to: Option<i64>,
        text: &str,
    ) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(message_id) = reply_to {
            body["reply_parameters"] = serde_json::json!({
                "message_id": message_id,
                "allow_sending_without_reply": true,
            });
        }

        let markdown_resp = self.post(&body).await?;
        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        let plain_resp = self.post(&body).await?;
        if !plain_resp.status().is_success() {
            let plain_status = plain_resp.status();
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(ChannelError::SendFailed {
                name: "telegram".into(),
                reason: format!(
                    "sendMessage failed (markdown: {markdown_status}, plain: {plain_status} {plain_err})"
                ),
            });
        }
        Ok(())
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, ChannelError> {
        self.client
            .post(self.api_url("sendMessage"))
            .json(body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(e.without_url().to_string()))
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send_message(&self, routing: &Routing, text: &str) -> Result<(), ChannelError> {
        let reply_to = routing
            .origin_message_id
            .as_deref()
            .and_then(|id| id.parse::<i64>().ok());

        for (i, chunk) in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH)
            .iter()
            .enumerate()
        {
            // Only the first chunk replies to the original message.
            let reply = if i == 0 { reply_to } else { None };
            self.send_chunk(&routing.session_id, reply, chunk).await?;
        }
        Ok(())
    }
}

/// Split a message into chunks that fit Telegram's limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut boundary = max_len;
        while !remaining.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let window = &remaining[..boundary];
        let split_at = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&at| at > 0)
            .unwrap_or(boundary);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
