//! Filesystem storage backend.
//!
//! One directory per application under the storage root, holding JSON
//! documents plus an append-only observation journal:
//!
//! ```text
//! <root>/<aid>/description.json
//! <root>/<aid>/doe.json
//! <root>/<aid>/cluster.json
//! <root>/<aid>/prediction.json
//! <root>/<aid>/observations.jsonl
//! <root>/<aid>/models/<metric>.json
//! ```
//!
//! Stores are write-temp-then-rename, so a concurrent load sees either the
//! previous or the new document, never a torn one.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use agora_core::{
    ApplicationId, BlockDescription, Cluster, Doe, OperatingPoint, PluginConfiguration,
    PluginKind, Prediction,
};

use crate::{Storage, StorageError, StorageResult};

const DESCRIPTION_FILE: &str = "description.json";
const DOE_FILE: &str = "doe.json";
const CLUSTER_FILE: &str = "cluster.json";
const PREDICTION_FILE: &str = "prediction.json";
const OBSERVATIONS_FILE: &str = "observations.jsonl";
const MODELS_DIR: &str = "models";

/// The filesystem backend.
pub struct FsStorage {
    root: PathBuf,
}

fn io_err(path: &Path, source: io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FsStorage {
    /// Opens (creating if needed) a storage tree rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    fn app_dir(&self, app_id: &ApplicationId) -> PathBuf {
        self.root.join(app_id.to_string())
    }

    fn document_path(&self, app_id: &ApplicationId, name: &str) -> PathBuf {
        self.app_dir(app_id).join(name)
    }

    fn model_path(&self, app_id: &ApplicationId, metric: &str) -> PathBuf {
        self.app_dir(app_id).join(MODELS_DIR).join(format!("{metric}.json"))
    }

    async fn write_document<T: serde::Serialize>(
        &self,
        path: &Path,
        document: &T,
    ) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(document).map_err(|e| StorageError::Corrupted {
            path: path.to_path_buf(),
            source: e,
        })?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| io_err(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| io_err(path, e))?;
        Ok(())
    }

    async fn read_document<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> StorageResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupted {
                    path: path.to_path_buf(),
                    source: e,
                }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(path, e)),
        }
    }

    async fn remove_if_present(&self, path: &Path) -> StorageResult<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(path, e)),
        }
    }

    fn container_entries(&self, app_id: &ApplicationId) -> Vec<(String, String)> {
        let dir = self.app_dir(app_id);
        let path = |name: &str| dir.join(name).display().to_string();
        vec![
            ("DESCRIPTION_CONTAINER_NAME".into(), path(DESCRIPTION_FILE)),
            ("DOE_CONTAINER_NAME".into(), path(DOE_FILE)),
            ("OBSERVATION_CONTAINER_NAME".into(), path(OBSERVATIONS_FILE)),
            ("MODEL_CONTAINER_NAME".into(), path(MODELS_DIR)),
            ("CLUSTER_CONTAINER_NAME".into(), path(CLUSTER_FILE)),
            ("PREDICTION_CONTAINER_NAME".into(), path(PREDICTION_FILE)),
        ]
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn store_description(
        &self,
        app_id: &ApplicationId,
        description: &BlockDescription,
    ) -> StorageResult<()> {
        self.write_document(&self.document_path(app_id, DESCRIPTION_FILE), description)
            .await
    }

    async fn load_description(
        &self,
        app_id: &ApplicationId,
    ) -> StorageResult<Option<BlockDescription>> {
        self.read_document(&self.document_path(app_id, DESCRIPTION_FILE))
            .await
    }

    async fn store_doe(&self, app_id: &ApplicationId, doe: &Doe) -> StorageResult<()> {
        self.write_document(&self.document_path(app_id, DOE_FILE), doe)
            .await
    }

    async fn load_doe(&self, app_id: &ApplicationId) -> StorageResult<Doe> {
        Ok(self
            .read_document(&self.document_path(app_id, DOE_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn update_doe_counter(
        &self,
        app_id: &ApplicationId,
        fingerprint: &str,
        counter: u32,
    ) -> StorageResult<()> {
        let mut doe = self.load_doe(app_id).await?;
        if counter == 0 {
            doe.required_explorations.remove(fingerprint);
        } else if let Some(entry) = doe.required_explorations.get_mut(fingerprint) {
            entry.counter = counter;
        } else {
            debug!(fingerprint, "counter update for an unknown doe entry");
            return Ok(());
        }
        self.store_doe(app_id, &doe).await
    }

    async fn clear_doe(&self, app_id: &ApplicationId) -> StorageResult<()> {
        self.remove_if_present(&self.document_path(app_id, DOE_FILE))
            .await
    }

    async fn create_observation_table(
        &self,
        app_id: &ApplicationId,
        _description: &BlockDescription,
    ) -> StorageResult<()> {
        let path = self.document_path(app_id, OBSERVATIONS_FILE);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }
        tokio::fs::write(&path, b"")
            .await
            .map_err(|e| io_err(&path, e))
    }

    async fn insert_observation(
        &self,
        app_id: &ApplicationId,
        client_id: &str,
        seconds: i64,
        nanoseconds: i64,
        op: &OperatingPoint,
    ) -> StorageResult<()> {
        let path = self.document_path(app_id, OBSERVATIONS_FILE);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err(parent, e))?;
        }

        let row = json!({
            "client_id": client_id,
            "seconds": seconds,
            "nanoseconds": nanoseconds,
            "op": op,
        });
        let mut line = row.to_string();
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await
            .map_err(|e| io_err(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| io_err(&path, e))
    }

    async fn is_model_valid(&self, app_id: &ApplicationId, metric: &str) -> StorageResult<bool> {
        let path = self.model_path(app_id, metric);
        match self.read_document::<Value>(&path).await? {
            // The plugin may record an explicit quality verdict.
            Some(document) => Ok(document
                .get("valid")
                .and_then(Value::as_bool)
                .unwrap_or(true)),
            None => Ok(false),
        }
    }

    async fn store_model(
        &self,
        app_id: &ApplicationId,
        metric: &str,
        artefact: &Value,
    ) -> StorageResult<()> {
        self.write_document(&self.model_path(app_id, metric), artefact)
            .await
    }

    async fn store_cluster(&self, app_id: &ApplicationId, cluster: &Cluster) -> StorageResult<()> {
        self.write_document(&self.document_path(app_id, CLUSTER_FILE), cluster)
            .await
    }

    async fn load_cluster(&self, app_id: &ApplicationId) -> StorageResult<Cluster> {
        Ok(self
            .read_document(&self.document_path(app_id, CLUSTER_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn store_prediction(
        &self,
        app_id: &ApplicationId,
        prediction: &Prediction,
    ) -> StorageResult<()> {
        self.write_document(&self.document_path(app_id, PREDICTION_FILE), prediction)
            .await
    }

    async fn load_prediction(&self, app_id: &ApplicationId) -> StorageResult<Prediction> {
        Ok(self
            .read_document(&self.document_path(app_id, PREDICTION_FILE))
            .await?
            .unwrap_or_default())
    }

    async fn erase(&self, app_id: &ApplicationId) -> StorageResult<()> {
        let dir = self.app_dir(app_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir, e)),
        }
    }

    fn create_env_entries(
        &self,
        kind: PluginKind,
        configuration: &PluginConfiguration,
    ) -> Vec<(String, String)> {
        let mut entries = vec![
            ("STORAGE_TYPE".to_string(), "fs".to_string()),
            (
                "STORAGE_ADDRESS".to_string(),
                self.root.display().to_string(),
            ),
            (
                "APPLICATION_NAME".to_string(),
                configuration.app_id.to_string(),
            ),
            ("PLUGIN_KIND".to_string(), kind.to_string()),
        ];
        entries.extend(self.container_entries(&configuration.app_id));

        if let Some(metric) = &configuration.metric_name {
            entries.push(("METRIC_NAME".to_string(), metric.clone()));
            entries.push((
                "METRIC_MODEL_CONTAINER_NAME".to_string(),
                self.model_path(&configuration.app_id, metric)
                    .display()
                    .to_string(),
            ));
        }
        if let Some(iteration) = configuration.iteration {
            entries.push(("ITERATION_COUNTER".to_string(), iteration.to_string()));
        }

        entries.extend(
            configuration
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        entries
    }

    fn supports_concurrency(&self) -> bool {
        // Every metric writes its own artefact file.
        true
    }
}
