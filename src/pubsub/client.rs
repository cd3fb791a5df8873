//! Broker client
//!
//! A reader task routes broker records: published messages and requests to
//! serve go to the [`Incoming`] receiver returned by
//! [`PubsubClient::connect`]; delivery notices and responses complete the
//! matching pending [`PubsubClient::request`]. When the connection ends every
//! pending request fails with [`PubsubError::Disconnected`] and the incoming
//! receiver is closed.

use super::protocol::{read_frame, write_frame, BrokerMessage, ClientMessage, RemoteResult};
use super::{PubsubError, ReservationDelivery};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A message published on a subscribed channel
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: String,
    pub payload: Value,
    /// Set for stored messages that must be acknowledged
    pub reservation: Option<ReservationDelivery>,
}

/// A request routed to this client
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingRequest {
    pub request_id: u64,
    pub channel: String,
    pub payload: Value,
}

/// Records the client receives without having asked for them
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(Message),
    Request(IncomingRequest),
}

struct PendingRequest {
    delivered: Option<oneshot::Sender<Option<String>>>,
    response: Option<oneshot::Sender<RemoteResult>>,
}

#[derive(Default)]
struct Shared {
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, PendingRequest>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Connection to the pub/sub broker
pub struct PubsubClient {
    outbox: mpsc::UnboundedSender<ClientMessage>,
    shared: Arc<Shared>,
    request_timeout: Duration,
    writer: JoinHandle<()>,
}

impl PubsubClient {
    /// Connect and announce how many requests this client serves at once
    pub async fn connect(
        address: &str,
        name: &str,
        parallel_requests: usize,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Incoming>), PubsubError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (outbox, mut outgoing) = mpsc::unbounded_channel::<ClientMessage>();
        let writer_task = tokio::spawn(async move {
            while let Some(record) = outgoing.recv().await {
                if let Err(e) = write_frame(&mut writer, &record).await {
                    debug!(error = %e, "Broker connection write failed");
                    break;
                }
            }
        });

        let shared = Arc::new(Shared::default());
        let (incoming, receiver) = mpsc::unbounded_channel();
        let reader_shared = shared.clone();
        tokio::spawn(async move {
            loop {
                match read_frame::<_, BrokerMessage>(&mut reader).await {
                    Ok(Some(record)) => route(&reader_shared, &incoming, record),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Broker connection read failed");
                        break;
                    }
                }
            }
            // Dropping the senders fails every pending request
            reader_shared.pending().clear();
        });

        let client = Self {
            outbox,
            shared,
            request_timeout,
            writer: writer_task,
        };
        client.send(ClientMessage::Hello {
            name: name.to_string(),
            parallel_requests,
        })?;
        Ok((client, receiver))
    }

    /// Write out everything queued so far, then drop the connection
    pub async fn close(self) {
        let Self { outbox, writer, .. } = self;
        drop(outbox);
        let _ = writer.await;
    }

    /// Whether the connection is still usable
    pub fn is_connected(&self) -> bool {
        !self.outbox.is_closed()
    }

    fn send(&self, record: ClientMessage) -> Result<(), PubsubError> {
        self.outbox
            .send(record)
            .map_err(|_| PubsubError::Disconnected)
    }

    /// Fire-and-forget publish
    pub fn publish(&self, channel: &str, payload: Value) -> Result<(), PubsubError> {
        self.send(ClientMessage::Publish {
            channel: channel.to_string(),
            payload,
        })
    }

    /// Subscribe to a channel and its sub-channels; with a reservation id the
    /// subscription outlives this connection
    pub fn subscribe(&self, channel: &str, reservation_id: Option<&str>) -> Result<(), PubsubError> {
        self.send(ClientMessage::Subscribe {
            channel: channel.to_string(),
            reservation_id: reservation_id.map(str::to_string),
        })
    }

    pub fn unsubscribe(&self, channel: &str) -> Result<(), PubsubError> {
        self.send(ClientMessage::Unsubscribe {
            channel: channel.to_string(),
        })
    }

    /// Confirm a stored message so the broker can drop it
    pub fn acknowledge(&self, delivery: &ReservationDelivery) -> Result<(), PubsubError> {
        self.send(ClientMessage::Acknowledge {
            reservation_id: delivery.reservation_id.clone(),
            channel: delivery.channel.clone(),
            message_id: delivery.message_id,
        })
    }

    /// Tell the broker a routed request was taken
    pub fn delivered(&self, request_id: u64) -> Result<(), PubsubError> {
        self.send(ClientMessage::Delivered { request_id })
    }

    /// Send the result of a routed request
    pub fn respond(&self, request_id: u64, result: Result<Value, String>) -> Result<(), PubsubError> {
        self.send(ClientMessage::Respond {
            request_id,
            result: result.into(),
        })
    }

    /// Issue a request to one subscriber of `channel` and wait for its result
    pub async fn request(&self, channel: &str, payload: Value) -> Result<Value, PubsubError> {
        let request_id = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (delivered_tx, delivered_rx) = oneshot::channel();
        let (response_tx, response_rx) = oneshot::channel();
        self.shared.pending().insert(
            request_id,
            PendingRequest {
                delivered: Some(delivered_tx),
                response: Some(response_tx),
            },
        );

        let outcome = match self.send(ClientMessage::Request {
            request_id,
            channel: channel.to_string(),
            payload,
        }) {
            Ok(()) => tokio::time::timeout(self.request_timeout, async {
                match delivered_rx.await {
                    Ok(None) => {}
                    Ok(Some(error)) => return Err(PubsubError::NoSubscriber(error)),
                    Err(_) => return Err(PubsubError::Disconnected),
                }
                match response_rx.await {
                    Ok(result) => result.into_result(),
                    Err(_) => Err(PubsubError::Disconnected),
                }
            })
            .await
            .unwrap_or(Err(PubsubError::Timeout)),
            Err(e) => Err(e),
        };

        self.shared.pending().remove(&request_id);
        outcome
    }
}

fn route(shared: &Shared, incoming: &mpsc::UnboundedSender<Incoming>, record: BrokerMessage) {
    match record {
        BrokerMessage::Message {
            channel,
            payload,
            reservation,
        } => {
            let _ = incoming.send(Incoming::Message(Message {
                channel,
                payload,
                reservation,
            }));
        }
        BrokerMessage::Request {
            request_id,
            channel,
            payload,
        } => {
            let _ = incoming.send(Incoming::Request(IncomingRequest {
                request_id,
                channel,
                payload,
            }));
        }
        BrokerMessage::Delivery { request_id, error } => {
            let mut pending = shared.pending();
            let failed = error.is_some();
            if let Some(request) = pending.get_mut(&request_id) {
                if let Some(delivered) = request.delivered.take() {
                    let _ = delivered.send(error);
                }
            }
            if failed {
                pending.remove(&request_id);
            }
        }
        BrokerMessage::Response { request_id, result } => {
            if let Some(mut request) = shared.pending().remove(&request_id) {
                // A response implies delivery, whichever notice arrives first
                if let Some(delivered) = request.delivered.take() {
                    let _ = delivered.send(None);
                }
                if let Some(response) = request.response.take() {
                    let _ = response.send(result);
                }
            }
        }
    }
}
