//! Best-effort notification sink (Gotify-style HTTP push).

use async_trait::async_trait;
use tracing::{debug, warn};

use vg_core::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Gotify's numeric scale.
    fn as_number(self) -> u8 {
        match self {
            Priority::Low => 2,
            Priority::Medium => 5,
            Priority::High => 8,
        }
    }
}

/// Delivery is best-effort; failures are logged, never propagated.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn notify(&self, title: &str, body: &str, priority: Priority) -> bool;
}

// ---------------------------------------------------------------------------
// HttpNotifier
// ---------------------------------------------------------------------------

pub struct HttpNotifier {
    http: reqwest::Client,
    url: String,
    token: String,
    enabled: bool,
}

impl HttpNotifier {
    pub fn new(config: &NotifyConfig) -> Self {
        let enabled = !config.url.is_empty() && !config.token.is_empty();
        if !enabled {
            debug!("notifications disabled (no url/token configured)");
        }
        Self {
            http: reqwest::Client::new(),
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            enabled,
        }
    }
}

#[async_trait]
impl NotifySink for HttpNotifier {
    async fn notify(&self, title: &str, body: &str, priority: Priority) -> bool {
        if !self.enabled {
            return false;
        }
        let payload = serde_json::json!({
            "title": title,
            "message": body,
            "priority": priority.as_number(),
        });
        let result = self
            .http
            .post(format!("{}/message", self.url))
            .header("Authorization", format!("Bearer {}", self.token))
            .timeout(std::time::Duration::from_secs(10))
            .json(&payload)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "notification rejected");
                false
            }
            Err(e) => {
                warn!(error = %e, "notification send failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Captures notifications for tests.
#[derive(Default)]
pub struct MemorySink {
    sent: std::sync::Mutex<Vec<(String, String, Priority)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String, Priority)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotifySink for MemorySink {
    async fn notify(&self, title: &str, body: &str, priority: Priority) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string(), priority));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_maps_to_gotify_scale() {
        assert_eq!(Priority::Low.as_number(), 2);
        assert_eq!(Priority::Medium.as_number(), 5);
        assert_eq!(Priority::High.as_number(), 8);
    }

    #[tokio::test]
    async fn unconfigured_notifier_is_disabled() {
        let notifier = HttpNotifier::new(&NotifyConfig::default());
        assert!(!notifier.notify("t", "b", Priority::High).await);
    }

    #[tokio::test]
    async fn memory_sink_records() {
        let sink = MemorySink::new();
        sink.notify("title", "body", Priority::High).await;
        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "title");
        assert_eq!(sent[0].2, Priority::High);
    }
}
