//! Pub/sub transport between the runner, workers and other components
//!
//! A broker process accepts TCP connections from clients. Clients can:
//! - Publish to hierarchical channels (`a/b` subscribers also get `a/b/c`)
//! - Subscribe ephemerally, or with a reservation id so messages published
//!   while disconnected are stored and replayed until acknowledged
//! - Issue requests that the broker routes to exactly one subscriber with
//!   spare capacity, and serve such requests
//!
//! Frames are a 4-byte big-endian length followed by a JSON record.

mod broker;
mod client;
mod protocol;

pub use broker::Broker;
pub use client::{Incoming, IncomingRequest, Message, PubsubClient};
pub use protocol::{
    read_frame, write_frame, BrokerMessage, ClientMessage, RemoteResult, ReservationDelivery,
    MAX_FRAME_LEN,
};

use thiserror::Error;

/// Pub/sub transport failures
#[derive(Debug, Error)]
pub enum PubsubError {
    #[error("connection to the broker was lost")]
    Disconnected,

    #[error("request timed out")]
    Timeout,

    #[error("no subscriber could take the request: {0}")]
    NoSubscriber(String),

    #[error("remote handler failed: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Whether a subscription to `subscribed` receives messages on `channel`
pub fn channel_matches(subscribed: &str, channel: &str) -> bool {
    match channel.strip_prefix(subscribed) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_matches() {
        assert!(channel_matches("changesets", "changesets"));
        assert!(channel_matches("changesets", "changesets/12"));
        assert!(channel_matches("a/b", "a/b/c"));
        assert!(!channel_matches("a/b", "a"));
        assert!(!channel_matches("changesets", "changesets2"));
        assert!(!channel_matches("a/b/c", "a/b"));
    }
}
