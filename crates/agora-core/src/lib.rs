//! Core data model and message plumbing for the Agora orchestrator.
//!
//! This crate holds everything the other Agora crates agree on:
//!
//! - the wire [`Message`] model, topic grammar and sanitiser;
//! - the synchronised [`Inbox`] the transport feeds and the workers drain;
//! - the application data model: [`ApplicationId`], [`BlockDescription`],
//!   [`Doe`], [`OperatingPoint`], [`Cluster`] and [`Prediction`];
//! - the [`HandlerState`] bitmask driving the per-application state machine;
//! - the [`PluginConfiguration`] handed to external plugin processes.
//!
//! No I/O happens here; transport, storage and process handling live in
//! their own crates behind traits.

pub mod app_id;
pub mod cluster;
pub mod description;
pub mod doe;
pub mod error;
pub mod message;
pub mod op;
pub mod plugin;
pub mod prediction;
pub mod queue;
pub mod state;
pub mod topic;

pub use app_id::ApplicationId;
pub use cluster::{Centroid, Cluster};
pub use description::{AgoraProperties, BlockDescription, Feature, Knob, Metric};
pub use doe::{Configuration, Doe, DoeEntry, fingerprint};
pub use error::{MessageError, MessageResult, ParseError, ParseResult};
pub use message::{MESSAGE_ROOT, Message};
pub use op::{MetricValue, OperatingPoint};
pub use plugin::{PluginConfiguration, PluginKind};
pub use prediction::{MetricEstimate, Prediction, PredictionRow};
pub use queue::Inbox;
pub use state::HandlerState;
pub use topic::{RoutedMessage, TopicKind};
