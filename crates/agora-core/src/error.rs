//! Error types shared by the core data model.

use thiserror::Error;

/// Errors produced while decoding topics and routing messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessageError {
    /// The topic does not start with the expected root segment.
    #[error("topic '{topic}' is outside the message root")]
    UnknownRoot {
        /// The offending topic.
        topic: String,
    },

    /// The trailing topic segment names no known message kind.
    #[error("unknown message kind '{kind}'")]
    UnknownKind {
        /// The unrecognised suffix.
        kind: String,
    },

    /// The topic has the right root but the wrong shape.
    #[error("malformed topic '{topic}'")]
    MalformedTopic {
        /// The offending topic.
        topic: String,
    },

    /// An application identifier segment could not be decoded.
    #[error("invalid application identifier '{0}'")]
    InvalidApplicationId(String),
}

/// Errors produced while parsing client payloads.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The payload is not well-formed JSON.
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The welcome document carries no block matching the application id.
    #[error("no block matching application '{0}' in the description")]
    MissingBlock(String),

    /// The document violates a structural invariant.
    #[error("invalid description: {0}")]
    Invalid(String),

    /// An observation payload is not `<sec> <ns> <json>`.
    #[error("malformed observation payload: {0}")]
    MalformedObservation(String),

    /// An operating point is inconsistent with the application description.
    #[error("operating point does not match the description: {0}")]
    Inconsistent(String),
}

/// Result alias for message decoding.
pub type MessageResult<T> = Result<T, MessageError>;

/// Result alias for payload parsing.
pub type ParseResult<T> = Result<T, ParseError>;
