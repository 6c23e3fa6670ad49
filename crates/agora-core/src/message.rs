//! The wire message model and the inbound sanitiser.
//!
//! A message is a `(topic, payload)` pair of strings. Topics are
//! `/`-delimited and rooted at [`MESSAGE_ROOT`]; the application identifier
//! travels as a single `^`-joined segment.

use std::fmt::{self, Display};

use crate::app_id::ApplicationId;

/// Root segment of every Agora topic.
pub const MESSAGE_ROOT: &str = "margot";

/// Topic of process-wide system commands (e.g. `shutdown`).
pub const SYSTEM_TOPIC: &str = "margot/system";

/// Synthetic topic messages rejected by the sanitiser are rewritten to.
pub const ERROR_TOPIC: &str = "margot/error/";

/// Synthetic topic the transport enqueues when the connection is lost.
///
/// Never appears on the wire; the `$` characters keep it outside the
/// sanitiser whitelist so a remote peer cannot forge it.
pub const DISCONNECT_TOPIC: &str = "$disconnect$";

/// Payload of the system shutdown command.
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// A generic message travelling through the Agora channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// The `/`-delimited topic.
    pub topic: String,
    /// The payload, opaque at this level.
    pub payload: String,
}

impl Message {
    /// Creates a new message.
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.topic, self.payload)
    }
}

/// Topic on which a configuration to explore is sent to one client.
pub fn explore_topic(app_id: &ApplicationId, client_id: &str) -> String {
    format!("{MESSAGE_ROOT}/{app_id}/{client_id}/explore")
}

/// Topic of the per-client prediction unicast.
pub fn prediction_topic(app_id: &ApplicationId, client_id: &str) -> String {
    format!("{MESSAGE_ROOT}/{app_id}/{client_id}/prediction")
}

/// Topic of the application-knowledge broadcast.
pub fn prediction_broadcast_topic(app_id: &ApplicationId) -> String {
    format!("{MESSAGE_ROOT}/{app_id}/prediction")
}

/// Topic of the abort unicast.
pub fn abort_topic(app_id: &ApplicationId, client_id: &str) -> String {
    format!("{MESSAGE_ROOT}/{app_id}/{client_id}/abort")
}

/// Topic of the goodbye message the adapter registers as its last will and
/// publishes on orderly disconnect.
pub fn goodbye_topic(identifier: &str, client_id: &str) -> String {
    format!("{MESSAGE_ROOT}/{identifier}/kia/{client_id}")
}

fn is_topic_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '/' | '^' | '.')
}

fn is_payload_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            ' ' | '_'
                | '-'
                | '.'
                | ':'
                | ','
                | '@'
                | '<'
                | '>'
                | '='
                | ';'
                | '('
                | ')'
                | '['
                | ']'
                | '{'
                | '}'
                | '^'
                | '*'
                | '+'
                | '\''
                | '"'
        )
}

/// Whitelists an inbound message before it reaches the inbox.
///
/// On any rejected character the message is rewritten in place to the
/// synthetic [`ERROR_TOPIC`] with a payload naming the offending field, so
/// operators still see it in the logs while handlers ignore it. Returns
/// whether the message passed untouched.
pub fn sanitize(message: &mut Message) -> bool {
    let bad_field = if !message.topic.chars().all(is_topic_char) {
        Some("topic")
    } else if !message.payload.chars().all(is_payload_char) {
        Some("payload")
    } else {
        None
    };

    match bad_field {
        None => true,
        Some(field) => {
            *message = Message::new(
                ERROR_TOPIC,
                format!("rejected illegal character in message {field}"),
            );
            false
        }
    }
}
