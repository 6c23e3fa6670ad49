//! Runtime orchestration for the Agora autotuning orchestrator.
//!
//! Wires the pieces together: the remote adapter feeds the inbox, the
//! worker pool drains it and dispatches to per-application handlers held
//! by the registry, and handlers drive the exploration → model →
//! prediction pipeline through the storage and launcher crates.

pub mod config;
pub mod handler;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod worker;

#[cfg(test)]
mod scenarios;

pub use config::{AgoraConfig, ConfigError, LogLevel, load_config};
pub use handler::{HandlerContext, RemoteApplicationHandler};
pub use logging::LoggingBuilder;
pub use registry::ApplicationRegistry;
pub use runtime::AgoraRuntime;
