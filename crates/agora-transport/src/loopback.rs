//! In-process publish/subscribe broker.
//!
//! The reference transport: a broker living inside the process, with
//! MQTT-style topic filters (`+` matches one segment, `#` the rest),
//! per-client FIFO delivery, and last-will support. Tests and single-host
//! deployments connect both the orchestrator and its clients here; a
//! networked broker would implement [`RemoteHandler`] behind the same
//! seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agora_core::message::{DISCONNECT_TOPIC, goodbye_topic, sanitize};
use agora_core::{Inbox, Message};

use crate::{RemoteConfiguration, RemoteHandler, TransportError, TransportResult};

/// Whether `topic` matches an MQTT-style `filter`.
///
/// `+` matches exactly one segment; `#` matches the remainder and must be
/// the final filter segment.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_segments = filter.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (filter_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

enum Delivery {
    Publish(Message),
    ConnectionLost(String),
}

struct ClientSlot {
    sender: mpsc::UnboundedSender<Delivery>,
    last_will: Option<Message>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientSlot>,
    /// `(client_id, filter)` pairs, in subscription order.
    subscriptions: Vec<(String, String)>,
}

/// The in-process broker all [`LoopbackClient`]s attach to.
#[derive(Default)]
pub struct LoopbackBroker {
    state: Mutex<BrokerState>,
}

impl LoopbackBroker {
    /// Creates an empty broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Routes a message to every client with a matching subscription.
    ///
    /// A client subscribed through several matching filters still receives
    /// the message once.
    pub fn publish(&self, message: &Message) {
        let state = self.state.lock();
        let mut delivered: Vec<&str> = Vec::new();
        for (client_id, filter) in &state.subscriptions {
            if delivered.iter().any(|c| c == client_id) {
                continue;
            }
            if !topic_matches(filter, &message.topic) {
                continue;
            }
            if let Some(slot) = state.clients.get(client_id) {
                let _ = slot.sender.send(Delivery::Publish(message.clone()));
                delivered.push(client_id);
            }
        }
    }

    /// Severs one client connection from the broker side: the client sees a
    /// synthetic disconnect and the registered last will is published on
    /// its behalf.
    pub fn drop_connection(&self, client_id: &str, cause: &str) {
        let (slot, had_client) = {
            let mut state = self.state.lock();
            state.subscriptions.retain(|(id, _)| id != client_id);
            let slot = state.clients.remove(client_id);
            let had = slot.is_some();
            (slot, had)
        };
        if let Some(slot) = slot {
            let _ = slot
                .sender
                .send(Delivery::ConnectionLost(cause.to_string()));
            if let Some(will) = slot.last_will {
                debug!(client_id, "publishing last will for dropped client");
                self.publish(&will);
            }
        }
        if !had_client {
            warn!(client_id, "dropping an unknown client");
        }
    }

    fn register(&self, client_id: &str, sender: mpsc::UnboundedSender<Delivery>, last_will: Option<Message>) {
        let mut state = self.state.lock();
        state.clients.insert(
            client_id.to_string(),
            ClientSlot { sender, last_will },
        );
    }

    fn unregister(&self, client_id: &str) {
        let mut state = self.state.lock();
        state.subscriptions.retain(|(id, _)| id != client_id);
        // A clean disconnect revokes the last will.
        state.clients.remove(client_id);
    }

    fn add_subscription(&self, client_id: &str, filter: &str) {
        let mut state = self.state.lock();
        let entry = (client_id.to_string(), filter.to_string());
        if !state.subscriptions.contains(&entry) {
            state.subscriptions.push(entry);
        }
    }

    fn remove_subscription(&self, client_id: &str, filter: &str) {
        let mut state = self.state.lock();
        state
            .subscriptions
            .retain(|(id, f)| !(id == client_id && f == filter));
    }
}

/// A client attached to a [`LoopbackBroker`].
///
/// Inbound deliveries flow through the sanitiser into the owned [`Inbox`];
/// connection loss surfaces as a synthetic `$disconnect$` message that
/// bypasses the whitelist (it is generated locally, never wire input).
pub struct LoopbackClient {
    id: String,
    broker: Arc<LoopbackBroker>,
    inbox: Arc<Inbox>,
    connected: AtomicBool,
    send_lock: tokio::sync::Mutex<()>,
    pump: CancellationToken,
    goodbye: Message,
}

impl LoopbackClient {
    /// Connects to the broker, registering the goodbye message as the last
    /// will and starting the delivery pump into `inbox`.
    pub fn connect(
        broker: Arc<LoopbackBroker>,
        configuration: &RemoteConfiguration,
        inbox: Arc<Inbox>,
    ) -> Arc<Self> {
        // Unique-ish on the channel; escape the characters the topic
        // whitelist refuses.
        let id = uuid::Uuid::new_v4().to_string().replace('-', "_");
        let goodbye = Message::new(
            goodbye_topic(&configuration.app_identifier, &id),
            "client has been disconnected",
        );

        let (sender, mut receiver) = mpsc::unbounded_channel();
        broker.register(&id, sender, Some(goodbye.clone()));

        let pump = CancellationToken::new();
        let client = Arc::new(Self {
            id,
            broker,
            inbox: Arc::clone(&inbox),
            connected: AtomicBool::new(true),
            send_lock: tokio::sync::Mutex::new(()),
            pump: pump.clone(),
            goodbye,
        });

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump.cancelled() => break,
                    delivery = receiver.recv() => match delivery {
                        Some(Delivery::Publish(mut message)) => {
                            sanitize(&mut message);
                            if !inbox.enqueue(message).await {
                                break;
                            }
                        }
                        Some(Delivery::ConnectionLost(cause)) => {
                            warn!(%cause, "lost connection with the broker");
                            let _ = inbox
                                .enqueue(Message::new(DISCONNECT_TOPIC, cause))
                                .await;
                        }
                        None => break,
                    },
                }
            }
        });

        client
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl RemoteHandler for LoopbackClient {
    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        self.ensure_connected()
            .map_err(|_| TransportError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "not connected".to_string(),
            })?;
        self.broker.add_subscription(&self.id, topic);
        debug!(client_id = %self.id, topic, "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        self.ensure_connected()?;
        self.broker.remove_subscription(&self.id, topic);
        debug!(client_id = %self.id, topic, "unsubscribed");
        Ok(())
    }

    async fn send(&self, message: Message) -> TransportResult<()> {
        // The shutdown path legitimately races sends from other workers.
        if self.ensure_connected().is_err() {
            warn!(topic = %message.topic, "attempt to send a message while disconnected");
            return Err(TransportError::NotConnected);
        }
        let _serialised = self.send_lock.lock().await;
        self.broker.publish(&message);
        Ok(())
    }

    async fn recv(&self) -> Option<Message> {
        self.inbox.dequeue().await
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            // Say goodbye ourselves; the clean unregister revokes the will.
            self.broker.publish(&self.goodbye);
            self.broker.unregister(&self.id);
            self.pump.cancel();
        }
        self.inbox.terminate();
    }

    fn client_id(&self) -> &str {
        &self.id
    }
}
