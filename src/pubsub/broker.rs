//! Pub/sub broker
//!
//! Every connection gets an outbox task that writes records in queue order,
//! so messages from one publisher reach one subscriber in publication order.
//! Requests are routed by a task per request: it picks the least busy
//! subscriber below its declared capacity, waits up to the delivery timeout
//! for the subscriber to take the request, and otherwise retries with another
//! pick until the request timeout runs out.

use super::protocol::{read_frame, write_frame, BrokerMessage, ClientMessage, RemoteResult};
use super::{channel_matches, PubsubError, ReservationDelivery};
use crate::config::PubsubConfig;
use crate::storage::Database;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often a waiting request re-checks subscriber capacity
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Subscription {
    channel: String,
    reservation_id: Option<String>,
}

struct Peer {
    name: String,
    outbox: mpsc::UnboundedSender<BrokerMessage>,
    parallel_requests: usize,
    in_flight: usize,
    subscriptions: Vec<Subscription>,
}

/// A request handed to a subscriber
struct Forwarded {
    requester: u64,
    requester_request: u64,
    subscriber: u64,
    delivered: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct BrokerState {
    next_peer: u64,
    next_request: u64,
    peers: HashMap<u64, Peer>,
    forwarded: HashMap<u64, Forwarded>,
}

/// The pub/sub broker
pub struct Broker {
    db: Option<Arc<Database>>,
    request_timeout: Duration,
    delivery_timeout: Duration,
    state: Mutex<BrokerState>,
    capacity: Notify,
}

impl Broker {
    /// Create a broker; reservations need a database
    pub fn new(db: Option<Arc<Database>>, config: &PubsubConfig) -> Self {
        Self {
            db,
            request_timeout: config.request_timeout(),
            delivery_timeout: config.delivery_timeout(),
            state: Mutex::new(BrokerState::default()),
            capacity: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept connections until the listener fails
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), PubsubError> {
        info!(address = ?listener.local_addr().ok(), "Pub/sub broker listening");
        loop {
            let (stream, address) = listener.accept().await?;
            debug!(%address, "Accepted connection");
            let broker = self.clone();
            tokio::spawn(async move { broker.handle_connection(stream).await });
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (mut reader, mut writer) = stream.into_split();
        let (outbox, mut outgoing) = mpsc::unbounded_channel::<BrokerMessage>();

        tokio::spawn(async move {
            while let Some(record) = outgoing.recv().await {
                if let Err(e) = write_frame(&mut writer, &record).await {
                    debug!(error = %e, "Client connection write failed");
                    break;
                }
            }
        });

        let peer = {
            let mut state = self.state();
            state.next_peer += 1;
            let id = state.next_peer;
            state.peers.insert(
                id,
                Peer {
                    name: format!("peer-{}", id),
                    outbox,
                    parallel_requests: 0,
                    in_flight: 0,
                    subscriptions: Vec::new(),
                },
            );
            id
        };

        loop {
            match read_frame::<_, ClientMessage>(&mut reader).await {
                Ok(Some(record)) => self.handle(peer, record),
                Ok(None) => break,
                Err(e) => {
                    warn!(peer, error = %e, "Client connection read failed");
                    break;
                }
            }
        }

        self.disconnect(peer);
    }

    fn handle(self: &Arc<Self>, peer: u64, record: ClientMessage) {
        match record {
            ClientMessage::Hello {
                name,
                parallel_requests,
            } => {
                debug!(peer, %name, parallel_requests, "Client introduced itself");
                if let Some(p) = self.state().peers.get_mut(&peer) {
                    p.name = name;
                    p.parallel_requests = parallel_requests;
                }
                self.capacity.notify_waiters();
            }
            ClientMessage::Subscribe {
                channel,
                reservation_id,
            } => self.subscribe(peer, channel, reservation_id),
            ClientMessage::Unsubscribe { channel } => {
                if let Some(p) = self.state().peers.get_mut(&peer) {
                    p.subscriptions.retain(|s| s.channel != channel);
                }
            }
            ClientMessage::Publish { channel, payload } => self.publish(&channel, payload),
            ClientMessage::Request {
                request_id,
                channel,
                payload,
            } => {
                let broker = self.clone();
                tokio::spawn(async move {
                    broker.route_request(peer, request_id, channel, payload).await
                });
            }
            ClientMessage::Delivered { request_id } => {
                let mut state = self.state();
                if let Some(forwarded) = state.forwarded.get_mut(&request_id) {
                    if let Some(delivered) = forwarded.delivered.take() {
                        let _ = delivered.send(());
                    }
                }
            }
            ClientMessage::Respond { request_id, result } => self.respond(request_id, result),
            ClientMessage::Acknowledge {
                reservation_id,
                channel,
                message_id,
            } => {
                if let Some(db) = &self.db {
                    if let Err(e) = db.acknowledge_message(&reservation_id, &channel, message_id) {
                        warn!(error = %e, "Failed to acknowledge message");
                    }
                }
            }
        }
    }

    fn subscribe(&self, peer: u64, channel: String, reservation_id: Option<String>) {
        let mut replay = Vec::new();
        if let (Some(db), Some(reservation)) = (&self.db, &reservation_id) {
            let stored = db
                .add_reservation(reservation, &channel)
                .and_then(|_| db.pending_reserved_messages(reservation, &channel));
            match stored {
                Ok(messages) => replay = messages,
                Err(e) => warn!(error = %e, %channel, "Failed to load reserved messages"),
            }
        }

        let mut state = self.state();
        let Some(p) = state.peers.get_mut(&peer) else {
            return;
        };
        debug!(peer = %p.name, %channel, reserved = reservation_id.is_some(), "Subscribed");

        if let Some(reservation) = &reservation_id {
            for message in replay {
                let payload = match serde_json::from_slice(&message.payload) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, message = message.id, "Dropping undecodable stored message");
                        continue;
                    }
                };
                let _ = p.outbox.send(BrokerMessage::Message {
                    channel: message.channel,
                    payload,
                    reservation: Some(ReservationDelivery {
                        reservation_id: reservation.clone(),
                        channel: channel.clone(),
                        message_id: message.id,
                    }),
                });
            }
        }

        p.subscriptions.push(Subscription {
            channel,
            reservation_id,
        });
        drop(state);
        self.capacity.notify_waiters();
    }

    fn publish(&self, channel: &str, payload: Value) {
        // Channels covered by a reservation keep a stored copy
        let mut stored: Option<(i64, Vec<(String, String)>)> = None;
        if let Some(db) = &self.db {
            let result = db.reservations_matching(channel).and_then(|reservations| {
                if reservations.is_empty() {
                    return Ok(None);
                }
                let bytes = serde_json::to_vec(&payload)?;
                let id = db.store_reserved_message(channel, &bytes, &reservations)?;
                Ok(Some((id, reservations)))
            });
            match result {
                Ok(value) => stored = value,
                Err(e) => warn!(error = %e, %channel, "Failed to store reserved message"),
            }
        }

        let state = self.state();
        for peer in state.peers.values() {
            let mut sent_plain = false;
            for subscription in &peer.subscriptions {
                if !channel_matches(&subscription.channel, channel) {
                    continue;
                }
                let reservation = match (&subscription.reservation_id, &stored) {
                    (None, _) if !sent_plain => {
                        sent_plain = true;
                        None
                    }
                    (Some(reservation), Some((message_id, reservations)))
                        if reservations
                            .iter()
                            .any(|(r, c)| r == reservation && c == &subscription.channel) =>
                    {
                        Some(ReservationDelivery {
                            reservation_id: reservation.clone(),
                            channel: subscription.channel.clone(),
                            message_id: *message_id,
                        })
                    }
                    _ => continue,
                };
                let _ = peer.outbox.send(BrokerMessage::Message {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                    reservation,
                });
            }
        }
    }

    /// Hand the request to the least busy eligible subscriber
    fn pick(
        &self,
        requester: u64,
        requester_request: u64,
        channel: &str,
        payload: &Value,
        tried: &HashSet<u64>,
    ) -> Option<(u64, u64, oneshot::Receiver<()>)> {
        let mut state = self.state();
        let subscriber = state
            .peers
            .iter()
            .filter(|(id, p)| {
                !tried.contains(*id)
                    && p.in_flight < p.parallel_requests
                    && p.subscriptions
                        .iter()
                        .any(|s| channel_matches(&s.channel, channel))
            })
            .min_by_key(|(id, p)| (p.in_flight, **id))
            .map(|(id, _)| *id)?;

        state.next_request += 1;
        let forwarded_id = state.next_request;
        let (delivered, receiver) = oneshot::channel();
        state.forwarded.insert(
            forwarded_id,
            Forwarded {
                requester,
                requester_request,
                subscriber,
                delivered: Some(delivered),
            },
        );

        let peer = state.peers.get_mut(&subscriber)?;
        peer.in_flight += 1;
        let _ = peer.outbox.send(BrokerMessage::Request {
            request_id: forwarded_id,
            channel: channel.to_string(),
            payload: payload.clone(),
        });
        Some((subscriber, forwarded_id, receiver))
    }

    /// Eligible subscribers exist but every one of them was tried already
    fn only_tried_remain(&self, channel: &str, tried: &HashSet<u64>) -> bool {
        !tried.is_empty()
            && self.state().peers.iter().all(|(id, p)| {
                tried.contains(id)
                    || !p.subscriptions.iter().any(|s| channel_matches(&s.channel, channel))
            })
    }

    async fn route_request(
        self: Arc<Self>,
        requester: u64,
        request_id: u64,
        channel: String,
        payload: Value,
    ) {
        let deadline = Instant::now() + self.request_timeout;
        let mut tried = HashSet::new();

        loop {
            let picked = loop {
                let notified = self.capacity.notified();
                if let Some(picked) = self.pick(requester, request_id, &channel, &payload, &tried) {
                    break Some(picked);
                }
                if self.only_tried_remain(&channel, &tried) {
                    tried.clear();
                    continue;
                }
                let now = Instant::now();
                if now >= deadline {
                    break None;
                }
                let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
            };

            let Some((subscriber, forwarded_id, delivered)) = picked else {
                self.send(
                    requester,
                    BrokerMessage::Delivery {
                        request_id,
                        error: Some(format!("timeout picking subscriber for {}", channel)),
                    },
                );
                return;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(self.delivery_timeout.min(remaining), delivered).await {
                Ok(Ok(())) => {
                    self.send(
                        requester,
                        BrokerMessage::Delivery {
                            request_id,
                            error: None,
                        },
                    );
                    return;
                }
                _ => {
                    warn!(%channel, subscriber, "Request not delivered, picking again");
                    self.abandon(forwarded_id);
                    tried.insert(subscriber);
                }
            }
        }
    }

    /// Forget a forwarded request that was never taken
    fn abandon(&self, forwarded_id: u64) {
        let mut state = self.state();
        if let Some(forwarded) = state.forwarded.remove(&forwarded_id) {
            if let Some(peer) = state.peers.get_mut(&forwarded.subscriber) {
                peer.in_flight = peer.in_flight.saturating_sub(1);
            }
        }
        drop(state);
        self.capacity.notify_waiters();
    }

    fn respond(&self, forwarded_id: u64, result: RemoteResult) {
        let mut state = self.state();
        let Some(forwarded) = state.forwarded.remove(&forwarded_id) else {
            return;
        };
        if let Some(peer) = state.peers.get_mut(&forwarded.subscriber) {
            peer.in_flight = peer.in_flight.saturating_sub(1);
        }
        if let Some(requester) = state.peers.get(&forwarded.requester) {
            let _ = requester.outbox.send(BrokerMessage::Response {
                request_id: forwarded.requester_request,
                result,
            });
        }
        drop(state);
        self.capacity.notify_waiters();
    }

    fn send(&self, peer: u64, record: BrokerMessage) {
        if let Some(p) = self.state().peers.get(&peer) {
            let _ = p.outbox.send(record);
        }
    }

    fn disconnect(&self, peer: u64) {
        let mut state = self.state();
        if let Some(p) = state.peers.remove(&peer) {
            debug!(peer = %p.name, "Client disconnected");
        }

        let lost: Vec<u64> = state
            .forwarded
            .iter()
            .filter(|(_, f)| f.subscriber == peer)
            .map(|(id, _)| *id)
            .collect();
        for id in lost {
            let Some(forwarded) = state.forwarded.remove(&id) else {
                continue;
            };
            // Undelivered requests are re-routed by their routing task when
            // the delivery sender drops
            if forwarded.delivered.is_none() {
                if let Some(requester) = state.peers.get(&forwarded.requester) {
                    let _ = requester.outbox.send(BrokerMessage::Response {
                        request_id: forwarded.requester_request,
                        result: RemoteResult::Error {
                            message: "subscriber disconnected".to_string(),
                        },
                    });
                }
            }
        }
        drop(state);
        self.capacity.notify_waiters();
    }
}
