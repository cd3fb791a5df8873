use crate::pubsub::PubsubClient;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A message for consumers waiting on cache state
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub channel: String,
    pub payload: Value,
}

impl Notification {
    pub fn changeset(id: i64, event: &str) -> Self {
        Self {
            channel: format!("changesets/{}", id),
            payload: json!({ "changeset": id, "event": event }),
        }
    }

    pub fn highlight_file(id: i64, highlighted: bool) -> Self {
        Self {
            channel: format!("highlightfiles/{}", id),
            payload: json!({ "highlight_file": id, "highlighted": highlighted }),
        }
    }

    pub fn review(id: i64, event: i64) -> Self {
        Self {
            channel: format!("reviews/{}", id),
            payload: json!({ "review": id, "event": event }),
        }
    }
}

/// Where notifications go
pub trait Publisher: Send + Sync {
    fn publish(&self, notification: &Notification);
}

/// Publish through the broker
pub struct PubsubPublisher {
    client: Arc<PubsubClient>,
}

impl PubsubPublisher {
    pub fn new(client: Arc<PubsubClient>) -> Self {
        Self { client }
    }
}

impl Publisher for PubsubPublisher {
    fn publish(&self, notification: &Notification) {
        debug!(channel = %notification.channel, "Publishing");
        if let Err(e) = self
            .client
            .publish(&notification.channel, notification.payload.clone())
        {
            warn!(channel = %notification.channel, error = %e, "Failed to publish");
        }
    }
}

/// Without a broker notifications only reach the log
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&self, notification: &Notification) {
        info!(channel = %notification.channel, payload = %notification.payload, "Notification");
    }
}

/// Keeps every notification for inspection
#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Notification>>,
}

impl RecordingPublisher {
    pub fn channels(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|n| n.channel.clone())
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, notification: &Notification) {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification.clone());
    }
}
