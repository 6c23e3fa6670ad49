//! # Agora
//!
//! An online autotuning orchestrator: applications linked against the
//! mARGOt client library register over a publish/subscribe channel,
//! receive configurations to explore, stream observations back, and
//! eventually receive the broadcast *application knowledge* computed by
//! external modelling plugins.
//!
//! ## Architecture
//!
//! ```text
//! transport ──▶ sanitiser ──▶ inbox ──▶ worker pool ──▶ registry
//!                                                          │
//!                                            application handler (FSM)
//!                                           ┌──────┬───────┴──┬───────┐
//!                                        storage  doe      models  predict
//!                                                  └── plugin processes ──┘
//! ```
//!
//! - **agora-core**: message/topic model, inbox queue, application data
//!   model and the handler state bitmask
//! - **agora-transport**: the publish/subscribe seam plus the in-process
//!   loopback broker
//! - **agora-storage**: durable per-application storage
//! - **agora-launcher**: plugin workspaces and child processes
//! - **agora-runtime**: handlers, registry, worker pool, config, logging
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use agora::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let configuration = load_config()?;
//!     let (_broker, runtime) = AgoraRuntime::with_loopback(configuration)?;
//!     runtime.run().await
//! }
//! ```

pub use agora_core::*;

pub use agora_launcher;
pub use agora_runtime;
pub use agora_storage;
pub use agora_transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use agora_runtime::{AgoraConfig, AgoraRuntime, LoggingBuilder, load_config};

    pub use agora_core::{ApplicationId, HandlerState, Message};
    pub use agora_launcher::{Launcher, LauncherConfiguration};
    pub use agora_storage::{FsStorage, Storage};
    pub use agora_transport::RemoteHandler;
    pub use agora_transport::loopback::{LoopbackBroker, LoopbackClient};
}
