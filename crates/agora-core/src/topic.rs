//! Topic decoding: from a raw topic string to a routed message kind.
//!
//! Worker dispatch keys off the trailing topic segment, so the decoder is a
//! small closed enumeration plus a shape check on the remaining segments.

use std::fmt::{self, Display};

use crate::app_id::ApplicationId;
use crate::error::{MessageError, MessageResult};
use crate::message::{DISCONNECT_TOPIC, MESSAGE_ROOT};

/// The closed set of message kinds travelling on Agora topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// A client announcing itself, payload is the application description.
    Welcome,
    /// A client leaving (or its broker-forwarded last will).
    Kia,
    /// An observation sample from a client.
    Observation,
    /// A configuration sent to a client (outbound only).
    Explore,
    /// The application knowledge, unicast or broadcast (outbound only).
    Prediction,
    /// An abort notification (outbound only).
    Abort,
    /// A process-wide command on the system topic.
    System,
    /// A message the sanitiser rejected and rewrote.
    Error,
    /// The synthetic transport-disconnect notification.
    Disconnect,
}

impl TopicKind {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "welcome" => Some(Self::Welcome),
            "kia" => Some(Self::Kia),
            "observation" => Some(Self::Observation),
            "explore" => Some(Self::Explore),
            "prediction" => Some(Self::Prediction),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

impl Display for TopicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Welcome => "welcome",
            Self::Kia => "kia",
            Self::Observation => "observation",
            Self::Explore => "explore",
            Self::Prediction => "prediction",
            Self::Abort => "abort",
            Self::System => "system",
            Self::Error => "error",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// A decoded topic: the kind plus the identifiers it addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    /// What the message is about.
    pub kind: TopicKind,
    /// The addressed application, when the topic names one.
    pub app_id: Option<ApplicationId>,
    /// The addressed client, when the topic names one.
    pub client_id: Option<String>,
}

impl RoutedMessage {
    fn new(kind: TopicKind) -> Self {
        Self {
            kind,
            app_id: None,
            client_id: None,
        }
    }
}

/// Decodes a topic string into a [`RoutedMessage`].
///
/// Accepted shapes:
/// - `$disconnect$` (synthetic);
/// - `margot/system`;
/// - `margot/error/` and anything below it;
/// - `margot/<aid>/<cid>/<kind>`;
/// - `margot/<aid>/prediction` (the broadcast).
///
/// Anything else is an error the caller logs and drops.
pub fn route(topic: &str) -> MessageResult<RoutedMessage> {
    if topic == DISCONNECT_TOPIC {
        return Ok(RoutedMessage::new(TopicKind::Disconnect));
    }

    let mut segments = topic.split('/');
    if segments.next() != Some(MESSAGE_ROOT) {
        return Err(MessageError::UnknownRoot {
            topic: topic.to_string(),
        });
    }

    let segments: Vec<&str> = segments.collect();
    match segments.as_slice() {
        ["system"] => Ok(RoutedMessage::new(TopicKind::System)),
        ["error", ..] => Ok(RoutedMessage::new(TopicKind::Error)),
        [aid, "prediction"] => {
            let app_id = aid.parse()?;
            Ok(RoutedMessage {
                kind: TopicKind::Prediction,
                app_id: Some(app_id),
                client_id: None,
            })
        }
        [aid, cid, suffix] => {
            let kind = TopicKind::from_suffix(suffix).ok_or_else(|| MessageError::UnknownKind {
                kind: (*suffix).to_string(),
            })?;
            let app_id = aid.parse()?;
            Ok(RoutedMessage {
                kind,
                app_id: Some(app_id),
                client_id: Some((*cid).to_string()),
            })
        }
        _ => Err(MessageError::MalformedTopic {
            topic: topic.to_string(),
        }),
    }
}
