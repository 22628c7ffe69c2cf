/// Notification Dispatch Bridge
///
/// Outbound boundary for unlock events. The reconciler calls these
/// methods fire-and-forget: a failed or slow dispatch is logged by the
/// caller and never rolls back unlock state. Implementations must be
/// time-bounded.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

#[async_trait]
pub trait NotificationBridge: Send + Sync {
    /// One tip just became visible for the user
    async fn notify_tip_unlocked(&self, user_id: i64, tip_id: i64, position: i32) -> Result<()>;

    /// The user's third tip of the day unlocked
    async fn notify_daily_completion(&self, user_id: i64, level: i32) -> Result<()>;
}

/// POSTs unlock events as JSON to a configured webhook (the push/realtime
/// delivery service consumes them from there)
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout_secs: u64) -> Result<Self> {
        // The timeout bounds the whole dispatch; unlock processing never
        // waits longer than this on the notification channel
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create notification HTTP client")?;

        Ok(Self { client, url })
    }

    async fn post(&self, body: serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("Failed to send notification webhook")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Notification webhook error (status {}): {}", status, text);
        }

        Ok(())
    }
}

#[async_trait]
impl NotificationBridge for WebhookNotifier {
    async fn notify_tip_unlocked(&self, user_id: i64, tip_id: i64, position: i32) -> Result<()> {
        self.post(json!({
            "type": "tip_unlocked",
            "user_id": user_id,
            "tip_id": tip_id,
            "position": position,
        }))
        .await
    }

    async fn notify_daily_completion(&self, user_id: i64, level: i32) -> Result<()> {
        self.post(json!({
            "type": "daily_completion",
            "user_id": user_id,
            "level": level,
        }))
        .await
    }
}

/// Drops notifications, for local development without a delivery service
pub struct NoopNotifier;

#[async_trait]
impl NotificationBridge for NoopNotifier {
    async fn notify_tip_unlocked(&self, user_id: i64, tip_id: i64, position: i32) -> Result<()> {
        log::debug!(
            "Dropping tip_unlocked notification (user {}, tip {}, position {})",
            user_id,
            tip_id,
            position
        );
        Ok(())
    }

    async fn notify_daily_completion(&self, user_id: i64, level: i32) -> Result<()> {
        log::debug!(
            "Dropping daily_completion notification (user {}, level {})",
            user_id,
            level
        );
        Ok(())
    }
}
