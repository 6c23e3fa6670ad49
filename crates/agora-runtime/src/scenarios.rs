//! End-to-end scenarios over the loopback broker, with stub plugin
//! scripts that write their artefacts straight into the storage tree.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use agora_core::message::MESSAGE_ROOT;
use agora_core::{ApplicationId, Inbox, Message, Prediction, PredictionRow};
use agora_launcher::LauncherConfiguration;
use agora_storage::{BoxedStorage, FsStorage, Storage};
use agora_transport::loopback::{LoopbackBroker, LoopbackClient};
use agora_transport::{RemoteConfiguration, RemoteHandler};

use crate::handler::HandlerContext;
use crate::registry::ApplicationRegistry;
use crate::worker::spawn_workers;

const AID: &str = "app^v1^blk";

fn aid() -> ApplicationId {
    ApplicationId::new("app", "v1", "blk")
}

fn welcome_payload() -> String {
    json!({
        "name": "app",
        "version": "v1",
        "blocks": [{
            "name": "blk",
            "knobs": [{"name": "k", "type": "int", "values": [1, 2]}],
            "metrics": [{"name": "m", "type": "int", "prediction_plugin": "model"}],
            "agora": {
                "doe_plugin": "doe",
                "number_configurations_per_iteration": 2,
                "number_observations_per_configuration": 1
            }
        }]
    })
    .to_string()
}

fn observation_payload(seconds: i64, k: i64, m: i64) -> String {
    format!(
        "{seconds} 0 {}",
        json!({"blk": [{"knobs": {"k": k}, "metrics": {"m": m}}]})
    )
}

/// The doe stub plans `k=1` and `k=2`, one observation each.
const DOE_PLUGIN: &str = r#". "$1"
echo run >> "$STORAGE_ADDRESS/doe_runs.log"
cat > "$DOE_CONTAINER_NAME" <<'DOC'
{"required_explorations":{"k=1":{"configuration":{"k":"1"},"counter":1},"k=2":{"configuration":{"k":"2"},"counter":1}}}
DOC"#;

const EMPTY_DOE_PLUGIN: &str = r#". "$1"
echo run >> "$STORAGE_ADDRESS/doe_runs.log"
echo '{"required_explorations":{}}' > "$DOE_CONTAINER_NAME""#;

const MODEL_PLUGIN: &str = r#". "$1"
echo run >> "$STORAGE_ADDRESS/model_runs.log"
mkdir -p "$MODEL_CONTAINER_NAME"
echo '{"valid": true}' > "$MODEL_CONTAINER_NAME/$METRIC_NAME.json""#;

const PREDICT_PLUGIN: &str = r#". "$1"
echo run >> "$STORAGE_ADDRESS/predict_runs.log"
cat > "$PREDICTION_CONTAINER_NAME" <<'DOC'
{"rows":[{"configuration":{"k":"2"},"metrics":{"m":{"mean":"42"}}}]}
DOC"#;

struct Harness {
    _dir: tempfile::TempDir,
    broker: Arc<LoopbackBroker>,
    storage: Arc<FsStorage>,
    registry: Arc<ApplicationRegistry>,
    workers: Vec<JoinHandle<()>>,
    server: Arc<LoopbackClient>,
}

fn write_plugin(root: &Path, name: &str, body: &str) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let script = dir.join("plugin.sh");
    std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
}

impl Harness {
    async fn start(plugins: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let storage_root = dir.path().join("storage");
        let plugin_root = dir.path().join("plugins");
        let workspace_root = dir.path().join("workspaces");
        for (name, body) in plugins {
            write_plugin(&plugin_root, name, body);
        }

        let storage = Arc::new(FsStorage::open(&storage_root).unwrap());
        let broker = LoopbackBroker::new();
        let server = LoopbackClient::connect(
            Arc::clone(&broker),
            &RemoteConfiguration::default(),
            Arc::new(Inbox::default()),
        );
        for topic in [
            format!("{MESSAGE_ROOT}/+/+/welcome"),
            format!("{MESSAGE_ROOT}/+/+/kia"),
            format!("{MESSAGE_ROOT}/+/+/observation"),
            format!("{MESSAGE_ROOT}/system"),
        ] {
            server.subscribe(&topic).await.unwrap();
        }

        let registry = Arc::new(ApplicationRegistry::new(HandlerContext {
            remote: server.clone(),
            storage: Arc::clone(&storage) as BoxedStorage,
            launcher_configuration: LauncherConfiguration::new(plugin_root, workspace_root),
        }));
        let workers = spawn_workers(2, server.clone(), Arc::clone(&registry));

        Self {
            _dir: dir,
            broker,
            storage,
            registry,
            workers,
            server,
        }
    }

    fn storage_root(&self) -> std::path::PathBuf {
        self._dir.path().join("storage")
    }

    fn run_count(&self, log: &str) -> usize {
        std::fs::read_to_string(self.storage_root().join(log))
            .map(|content| content.lines().count())
            .unwrap_or(0)
    }
}

/// A margot client attached to the same broker, subscribed to everything
/// the orchestrator may send it.
struct TestClient {
    remote: Arc<LoopbackClient>,
    id: &'static str,
}

impl TestClient {
    async fn connect(harness: &Harness, id: &'static str) -> Self {
        let remote = LoopbackClient::connect(
            Arc::clone(&harness.broker),
            &RemoteConfiguration::default(),
            Arc::new(Inbox::default()),
        );
        for topic in [
            format!("{MESSAGE_ROOT}/{AID}/{id}/explore"),
            format!("{MESSAGE_ROOT}/{AID}/{id}/prediction"),
            format!("{MESSAGE_ROOT}/{AID}/{id}/abort"),
            format!("{MESSAGE_ROOT}/{AID}/prediction"),
        ] {
            remote.subscribe(&topic).await.unwrap();
        }
        Self { remote, id }
    }

    async fn welcome(&self) {
        let topic = format!("{MESSAGE_ROOT}/{AID}/{}/welcome", self.id);
        self.remote
            .send(Message::new(topic, welcome_payload()))
            .await
            .unwrap();
    }

    async fn observe(&self, seconds: i64, k: i64, m: i64) {
        let topic = format!("{MESSAGE_ROOT}/{AID}/{}/observation", self.id);
        self.remote
            .send(Message::new(topic, observation_payload(seconds, k, m)))
            .await
            .unwrap();
    }

    async fn kia(&self) {
        let topic = format!("{MESSAGE_ROOT}/{AID}/{}/kia", self.id);
        self.remote.send(Message::new(topic, "")).await.unwrap();
    }

    async fn expect_message(&self) -> Message {
        tokio::time::timeout(Duration::from_secs(10), self.remote.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed")
    }

    async fn expect_silence(&self) {
        let outcome =
            tokio::time::timeout(Duration::from_millis(300), self.remote.recv()).await;
        assert!(outcome.is_err(), "expected silence, got {:?}", outcome);
    }
}

fn knob_of(payload: &str) -> i64 {
    let document: Value = serde_json::from_str(payload).unwrap();
    document["blk"][0]["knobs"]["k"].as_i64().unwrap()
}

#[cfg(unix)]
#[tokio::test]
async fn s1_cold_start_sends_the_first_configuration() {
    let harness = Harness::start(&[
        ("doe", DOE_PLUGIN),
        ("model", MODEL_PLUGIN),
        ("predict", PREDICT_PLUGIN),
    ])
    .await;
    let client = TestClient::connect(&harness, "c1").await;

    client.welcome().await;
    let explore = client.expect_message().await;
    assert_eq!(explore.topic, format!("{MESSAGE_ROOT}/{AID}/c1/explore"));
    assert_eq!(knob_of(&explore.payload), 1);
    assert_eq!(harness.run_count("doe_runs.log"), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn s2_s3_full_pipeline_models_once_then_drops_late_observations() {
    let harness = Harness::start(&[
        ("doe", DOE_PLUGIN),
        ("model", MODEL_PLUGIN),
        ("predict", PREDICT_PLUGIN),
    ])
    .await;
    let client = TestClient::connect(&harness, "c1").await;

    client.welcome().await;
    let explore = client.expect_message().await;
    assert_eq!(knob_of(&explore.payload), 1);

    // First observation: one more configuration to explore.
    client.observe(100, 1, 42).await;
    let explore = client.expect_message().await;
    assert_eq!(knob_of(&explore.payload), 2);

    // Second observation exhausts the doe: models, prediction, broadcast.
    client.observe(100, 2, 40).await;
    let broadcast = client.expect_message().await;
    assert_eq!(broadcast.topic, format!("{MESSAGE_ROOT}/{AID}/prediction"));
    let document: Value = serde_json::from_str(&broadcast.payload).unwrap();
    assert_eq!(document["blk"][0]["metrics"]["m"], json!(42));
    assert_eq!(document["blk"][0]["knobs"]["k"], json!(2));

    assert_eq!(harness.run_count("model_runs.log"), 1);
    assert_eq!(harness.run_count("predict_runs.log"), 1);

    // A late observation is dropped: no publication, no storage write.
    let journal = harness.storage_root().join(AID).join("observations.jsonl");
    let rows_before = std::fs::read_to_string(&journal).unwrap().lines().count();
    client.observe(101, 1, 41).await;
    client.expect_silence().await;
    let rows_after = std::fs::read_to_string(&journal).unwrap().lines().count();
    assert_eq!(rows_before, rows_after);
    assert_eq!(rows_before, 2);
}

#[cfg(unix)]
#[tokio::test]
async fn s4_bye_last_client_resets_to_clueless_and_keeps_the_plan() {
    let harness = Harness::start(&[
        ("doe", DOE_PLUGIN),
        ("model", MODEL_PLUGIN),
        ("predict", PREDICT_PLUGIN),
    ])
    .await;
    let client = TestClient::connect(&harness, "c1").await;

    client.welcome().await;
    client.expect_message().await;

    client.kia().await;
    let handler = loop {
        if let Some(handler) = harness.registry.get(&aid()).await {
            if handler.active_client_count().await == 0 {
                break handler;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(handler.status().await, agora_core::HandlerState::CLUELESS);

    // A second welcome recovers the persisted doe without replanning.
    client.welcome().await;
    let explore = client.expect_message().await;
    assert_eq!(explore.topic, format!("{MESSAGE_ROOT}/{AID}/c1/explore"));
    assert_eq!(harness.run_count("doe_runs.log"), 1);
}

#[tokio::test]
async fn s5_recovery_hit_broadcasts_without_launching_any_plugin() {
    let harness = Harness::start(&[
        ("doe", DOE_PLUGIN),
        ("model", MODEL_PLUGIN),
        ("predict", PREDICT_PLUGIN),
    ])
    .await;

    // Pre-seed the knowledge, as a previous process run would have.
    let prediction = Prediction {
        rows: vec![PredictionRow {
            configuration: [("k".to_string(), "2".to_string())].into(),
            features: Default::default(),
            metrics: [(
                "m".to_string(),
                agora_core::MetricEstimate {
                    mean: "42".into(),
                    std: None,
                },
            )]
            .into(),
        }],
    };
    harness
        .storage
        .store_prediction(&aid(), &prediction)
        .await
        .unwrap();

    let client = TestClient::connect(&harness, "c1").await;
    client.welcome().await;

    let broadcast = client.expect_message().await;
    assert_eq!(broadcast.topic, format!("{MESSAGE_ROOT}/{AID}/prediction"));
    assert_eq!(harness.run_count("doe_runs.log"), 0);
    assert_eq!(harness.run_count("model_runs.log"), 0);
    assert_eq!(harness.run_count("predict_runs.log"), 0);

    // Observations are dropped while not exploring.
    client.observe(100, 1, 42).await;
    client.expect_silence().await;
    assert!(
        !harness
            .storage_root()
            .join(AID)
            .join("observations.jsonl")
            .exists()
    );
}

#[cfg(unix)]
#[tokio::test]
async fn s6_empty_doe_escalates_to_undefined_and_aborts_welcomers() {
    let harness = Harness::start(&[
        ("doe", EMPTY_DOE_PLUGIN),
        ("model", MODEL_PLUGIN),
        ("predict", PREDICT_PLUGIN),
    ])
    .await;

    let first = TestClient::connect(&harness, "c1").await;
    first.welcome().await;
    let abort = first.expect_message().await;
    assert_eq!(abort.topic, format!("{MESSAGE_ROOT}/{AID}/c1/abort"));

    let second = TestClient::connect(&harness, "c2").await;
    second.welcome().await;
    let abort = second.expect_message().await;
    assert_eq!(abort.topic, format!("{MESSAGE_ROOT}/{AID}/c2/abort"));
}

#[cfg(unix)]
#[tokio::test]
async fn shutdown_drains_workers_and_erases_application_state() {
    let mut harness = Harness::start(&[
        ("doe", DOE_PLUGIN),
        ("model", MODEL_PLUGIN),
        ("predict", PREDICT_PLUGIN),
    ])
    .await;
    let client = TestClient::connect(&harness, "c1").await;
    client.welcome().await;
    client.expect_message().await;
    assert!(harness.storage_root().join(AID).is_dir());

    client
        .remote
        .send(Message::new(format!("{MESSAGE_ROOT}/system"), "shutdown"))
        .await
        .unwrap();

    // The shutdown command disconnects the adapter; every worker drains.
    for worker in std::mem::take(&mut harness.workers) {
        tokio::time::timeout(Duration::from_secs(10), worker)
            .await
            .expect("worker did not drain")
            .unwrap();
    }
    assert!(
        harness
            .server
            .send(Message::new(format!("{MESSAGE_ROOT}/system"), "x"))
            .await
            .is_err()
    );

    harness.registry.shutdown().await;
    assert_eq!(harness.registry.count().await, 0);
    assert!(!harness.storage_root().join(AID).exists());
    let workspaces = harness._dir.path().join("workspaces").join(AID);
    for label in ["doe_doe", "model_model", "predict"] {
        assert!(!workspaces.join(label).exists());
    }
}

#[tokio::test]
async fn sanitiser_rejection_reaches_no_handler() {
    let harness = Harness::start(&[]).await;
    let sender = LoopbackClient::connect(
        Arc::clone(&harness.broker),
        &RemoteConfiguration::default(),
        Arc::new(Inbox::default()),
    );

    sender
        .send(Message::new(
            format!("{MESSAGE_ROOT}/app$v1$blk/c1/welcome"),
            welcome_payload(),
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.registry.count().await, 0);
}
