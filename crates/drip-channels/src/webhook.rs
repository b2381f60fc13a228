//! Webhook notifier — POSTs each campaign message as JSON.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use drip_core::config::WebhookConfig;
use drip_core::{DripError, Notifier, OutboundMessage, Result, SendOutcome};

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    headers: Vec<(String, String)>,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DripError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: config.url,
            headers: config.headers,
        })
    }
}

/// 2xx delivered; 408, 429 and 5xx may clear up; any other status will not.
fn classify_status(status: StatusCode) -> SendOutcome {
    if status.is_success() {
        SendOutcome::Sent
    } else if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        SendOutcome::Retriable(format!("Webhook error {status}"))
    } else {
        SendOutcome::Terminal(format!("Webhook error {status}"))
    }
}

fn payload(message: &OutboundMessage) -> serde_json::Value {
    serde_json::json!({
        "email": message.subscriber,
        "message": message.message,
        "count": message.tick_count,
        "dedup_key": message.dedup_key,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send_message(&self, message: &OutboundMessage) -> SendOutcome {
        let mut req = self
            .client
            .post(&self.url)
            .header("Idempotency-Key", message.dedup_key.as_str())
            .json(&payload(message));

        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_builder() => {
                return SendOutcome::Terminal(format!("Webhook request invalid: {e}"));
            }
            Err(e) => return SendOutcome::Retriable(format!("Webhook send failed: {e}")),
        };

        let outcome = classify_status(resp.status());
        if outcome == SendOutcome::Sent {
            tracing::info!("✅ Webhook notification sent to {}: {}", self.url, message.dedup_key);
        }
        outcome
    }
}
