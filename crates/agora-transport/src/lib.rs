//! Publish/subscribe transport seam for the Agora orchestrator.
//!
//! The core requires exactly one thing from the wire: topic-based
//! publish/subscribe with at-least-once delivery, a last will forwarded as
//! a normal goodbye, and per-publisher FIFO order per topic. Everything
//! behind that contract lives behind the [`RemoteHandler`] trait; the
//! [`loopback`] module provides the in-process reference implementation
//! used by tests and single-host deployments.

pub mod loopback;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use agora_core::Message;

/// Errors that can occur in transport operations.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Connection to the broker failed.
    #[error("connection failed: {url} - {reason}")]
    ConnectionFailed {
        /// The broker endpoint.
        url: String,
        /// Reason for failure.
        reason: String,
    },

    /// The adapter is not connected.
    #[error("not connected to the broker")]
    NotConnected,

    /// A publish was refused.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// A subscription could not be established.
    #[error("failed to subscribe to '{topic}': {reason}")]
    SubscribeFailed {
        /// The topic filter.
        topic: String,
        /// Reason for failure.
        reason: String,
    },
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A generic remote message handler over a publish/subscribe channel.
///
/// Implementations must:
/// - register a last will equal to their own goodbye message, so broker-side
///   disconnects surface to peers as a normal bye;
/// - sanitise every inbound wire message before enqueueing it;
/// - surface transport-level connection loss as a synthetic
///   `$disconnect$` message;
/// - serialise concurrent publishes (the wire client underneath is not
///   assumed reentrant-safe).
#[async_trait]
pub trait RemoteHandler: Send + Sync {
    /// Subscribes to a topic filter.
    async fn subscribe(&self, topic: &str) -> TransportResult<()>;

    /// Unsubscribes from a topic filter.
    async fn unsubscribe(&self, topic: &str) -> TransportResult<()>;

    /// Publishes a message.
    async fn send(&self, message: Message) -> TransportResult<()>;

    /// Receives the next inbound message, `None` once the channel has been
    /// terminated and drained.
    async fn recv(&self) -> Option<Message>;

    /// Publishes the goodbye message, tears the connection down and
    /// terminates the inbox so every consumer drains and exits. Idempotent.
    async fn disconnect(&self);

    /// The unique identifier this adapter is known by on the channel.
    fn client_id(&self) -> &str;
}

/// A shared remote handler handle.
pub type BoxedRemote = Arc<dyn RemoteHandler>;

/// Connection parameters of the remote adapter.
#[derive(Debug, Clone)]
pub struct RemoteConfiguration {
    /// The broker endpoint.
    pub broker_url: String,
    /// Username for authentication, if any.
    pub username: Option<String>,
    /// Password for authentication, if any.
    pub password: Option<String>,
    /// Quality-of-service / reliability level requested from the broker.
    pub qos: u8,
    /// The identifier segment used in the adapter's own goodbye topic.
    pub app_identifier: String,
}

impl Default for RemoteConfiguration {
    fn default() -> Self {
        Self {
            broker_url: "127.0.0.1:1883".to_string(),
            username: None,
            password: None,
            qos: 2,
            app_identifier: "agora".to_string(),
        }
    }
}
