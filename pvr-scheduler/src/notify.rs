//! Notification channel for UI/REST listeners.
//!
//! Messages are fire-and-forget: sending never fails even when nobody is
//! subscribed. An optional webhook forwarder posts every notification as
//! JSON to a configured URL.

use chrono::{DateTime, Utc};
use log::debug;
use pvr_protocol::Topic;
use serde::Serialize;
use tokio::sync::broadcast;

#[cfg(feature = "webhook")]
use reqwest::Client;

const CHANNEL_CAPACITY: usize = 256;

/// One broadcast message.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub topic: Topic,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Broadcast sender shared by the scheduler, the janitor and the importer.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Send a topic without payload.
    pub fn send_message(&self, topic: Topic) {
        self.send(topic, serde_json::Value::Null);
    }

    /// Send a topic with a JSON payload.
    pub fn send(&self, topic: Topic, payload: serde_json::Value) {
        let notification = Notification { topic, payload, at: Utc::now() };
        if self.tx.send(notification).is_err() {
            debug!("No listeners for notification {}", topic);
        }
    }
}

/// Forwards every notification to a webhook URL.
#[cfg(feature = "webhook")]
pub struct WebhookForwarder {
    client: Client,
    url: String,
}

#[cfg(feature = "webhook")]
impl WebhookForwarder {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: Client::new(), url: url.into() }
    }

    /// Run until the notifier is dropped.
    pub async fn run(self, mut rx: broadcast::Receiver<Notification>) {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    if let Err(e) = self.client.post(&self.url).json(&notification).send().await {
                        log::warn!("Webhook delivery of {} failed: {}", notification.topic, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Webhook forwarder lagged, {} notifications skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_reaches_subscribers() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe();

        notifier.send(Topic::RecordingAdded, serde_json::json!({ "id": 7 }));
        notifier.send_message(Topic::ImportProgress);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.topic, Topic::RecordingAdded);
        assert_eq!(first.payload["id"], 7);
        assert_eq!(rx.recv().await.unwrap().topic, Topic::ImportProgress);
    }

    #[test]
    fn test_send_without_listeners_is_silent() {
        let notifier = Notifier::new();
        notifier.send_message(Topic::RuleUpdated);
    }

    #[test]
    fn test_notification_json_shape() {
        let notification = Notification {
            topic: Topic::RecordingRemoved,
            payload: serde_json::Value::Null,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&notification).unwrap();
        assert_eq!(json["topic"], "recording.removed");
    }
}
