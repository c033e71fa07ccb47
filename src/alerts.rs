//! Alert sink for payout failures.
//!
//! One-shot delivery: a failed send is logged and dropped, never retried.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{error, warn};

/// Delivery channels for an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertChannel {
    Telegram,
}

/// Fire-and-forget alert sender.
#[async_trait]
pub trait Alerts: Send + Sync {
    async fn send_message(&self, text: &str, channels: &[AlertChannel]);
}

/// Telegram bot API sender.
pub struct TelegramAlerts {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramAlerts {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            bot_token,
            chat_id,
            client,
        }
    }
}

#[async_trait]
impl Alerts for TelegramAlerts {
    async fn send_message(&self, text: &str, channels: &[AlertChannel]) {
        if !channels.contains(&AlertChannel::Telegram) {
            return;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({ "chat_id": self.chat_id, "text": text });

        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                warn!(status = %resp.status(), "Telegram alert rejected");
            }
            Err(e) => {
                error!(error = %e, "Telegram alert failed");
            }
        }
    }
}

/// Sink used when no alert channel is configured; logs at warn level so
/// failures still surface somewhere.
pub struct LogAlerts;

#[async_trait]
impl Alerts for LogAlerts {
    async fn send_message(&self, text: &str, _channels: &[AlertChannel]) {
        warn!(alert = %text, "Alert (no channel configured)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_telegram_sender_skips_other_channels() {
        // No channel requested means no HTTP call; completes immediately.
        let sender = TelegramAlerts::new("token".to_string(), "chat".to_string());
        sender.send_message("hello", &[]).await;
    }
}
