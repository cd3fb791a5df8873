//! How jobs reach the request handlers

use crate::error::JobFailure;
use crate::pubsub::{PubsubClient, PubsubError};
use crate::worker::Handlers;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Sends a request to whoever serves `channel`
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, channel: &str, payload: Value) -> Result<Value, JobFailure>;

    /// Whether requests run outside this process; remote requests give up
    /// their pool slot once dispatched
    fn is_remote(&self) -> bool;
}

/// Handlers running inside the runner process
pub struct LocalTransport {
    handlers: Arc<Handlers>,
}

impl LocalTransport {
    pub fn new(handlers: Arc<Handlers>) -> Self {
        Self { handlers }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn request(&self, channel: &str, payload: Value) -> Result<Value, JobFailure> {
        self.handlers.handle(channel, payload).await
    }

    fn is_remote(&self) -> bool {
        false
    }
}

/// Workers reached through the broker
pub struct PubsubTransport {
    client: Arc<PubsubClient>,
}

impl PubsubTransport {
    pub fn new(client: Arc<PubsubClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for PubsubTransport {
    async fn request(&self, channel: &str, payload: Value) -> Result<Value, JobFailure> {
        self.client
            .request(channel, payload)
            .await
            .map_err(|e| match e {
                PubsubError::Remote(message) => JobFailure::from_wire(&message),
                other => JobFailure::transport(other.to_string()),
            })
    }

    fn is_remote(&self) -> bool {
        true
    }
}
