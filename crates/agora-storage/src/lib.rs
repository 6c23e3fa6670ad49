//! Durable per-application storage for the Agora orchestrator.
//!
//! The orchestrator persists, per application: the description, the design
//! of experiments, the observation table, one opaque model artefact per
//! metric, the feature clusters and the prediction table. The [`Storage`]
//! trait is the seam; [`FsStorage`] is the filesystem backend. A
//! wide-column backend would implement the same trait.
//!
//! Plugins share the storage tree: the env entries composed by
//! [`Storage::create_env_entries`] tell a plugin script where every
//! container lives.

pub mod fs;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use agora_core::{
    ApplicationId, BlockDescription, Cluster, Doe, OperatingPoint, PluginConfiguration,
    PluginKind, Prediction,
};

pub use fs::FsStorage;

/// Errors produced by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O operation failed.
    #[error("storage I/O error on '{path}': {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// A persisted document could not be decoded.
    #[error("corrupted document at '{path}': {source}")]
    Corrupted {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Whether retrying the operation once is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
            ),
            Self::Corrupted { .. } => false,
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// A shared storage handle.
pub type BoxedStorage = Arc<dyn Storage>;

/// The durable storage contract, keyed by application identifier.
///
/// Every `store_*` must be visible to a subsequent `load_*` from any task.
/// Atomicity is required within a single call, not across calls. Backends
/// must tolerate concurrent calls for different applications; a single
/// handler serialises its own calls.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists the application description.
    async fn store_description(
        &self,
        app_id: &ApplicationId,
        description: &BlockDescription,
    ) -> StorageResult<()>;

    /// Loads the application description, `None` when absent.
    async fn load_description(
        &self,
        app_id: &ApplicationId,
    ) -> StorageResult<Option<BlockDescription>>;

    /// Persists the design of experiments.
    async fn store_doe(&self, app_id: &ApplicationId, doe: &Doe) -> StorageResult<()>;

    /// Loads the design of experiments; an empty DoE when absent.
    async fn load_doe(&self, app_id: &ApplicationId) -> StorageResult<Doe>;

    /// Updates the remaining-exploration counter of one entry; a zero
    /// counter removes the entry.
    async fn update_doe_counter(
        &self,
        app_id: &ApplicationId,
        fingerprint: &str,
        counter: u32,
    ) -> StorageResult<()>;

    /// Drops the persisted design of experiments.
    async fn clear_doe(&self, app_id: &ApplicationId) -> StorageResult<()>;

    /// Creates (or resets) the observation table.
    async fn create_observation_table(
        &self,
        app_id: &ApplicationId,
        description: &BlockDescription,
    ) -> StorageResult<()>;

    /// Appends one observation row.
    async fn insert_observation(
        &self,
        app_id: &ApplicationId,
        client_id: &str,
        seconds: i64,
        nanoseconds: i64,
        op: &OperatingPoint,
    ) -> StorageResult<()>;

    /// Whether a valid model exists for `(app_id, metric)`. The modelling
    /// plugin alone decides validity and writes the artefact.
    async fn is_model_valid(&self, app_id: &ApplicationId, metric: &str) -> StorageResult<bool>;

    /// Persists a model artefact; meant for plugins and tests.
    async fn store_model(
        &self,
        app_id: &ApplicationId,
        metric: &str,
        artefact: &serde_json::Value,
    ) -> StorageResult<()>;

    /// Persists the feature clusters.
    async fn store_cluster(&self, app_id: &ApplicationId, cluster: &Cluster) -> StorageResult<()>;

    /// Loads the feature clusters; empty when absent.
    async fn load_cluster(&self, app_id: &ApplicationId) -> StorageResult<Cluster>;

    /// Persists the prediction table.
    async fn store_prediction(
        &self,
        app_id: &ApplicationId,
        prediction: &Prediction,
    ) -> StorageResult<()>;

    /// Loads the prediction table; empty when absent.
    async fn load_prediction(&self, app_id: &ApplicationId) -> StorageResult<Prediction>;

    /// Removes every trace of the application.
    async fn erase(&self, app_id: &ApplicationId) -> StorageResult<()>;

    /// Composes the environment entries a plugin invocation needs: storage
    /// coordinates, container locations, and the pass-through properties of
    /// `configuration`.
    fn create_env_entries(
        &self,
        kind: PluginKind,
        configuration: &PluginConfiguration,
    ) -> Vec<(String, String)>;

    /// Whether plugin invocations touching different metrics of the same
    /// application may run concurrently against this backend.
    fn supports_concurrency(&self) -> bool;
}
