//! The per-application handler: the state machine coordinating clients,
//! observation ingestion, plugin execution and persistence.
//!
//! One live handler exists per application identifier. All public entry
//! points serialise on the handler mutex; the mutex is released around
//! every plugin wait and every bulk storage phase, and the handler
//! re-checks its invariants after reacquiring it, because clients may have
//! come or gone in the meantime.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use agora_core::description::parse_welcome;
use agora_core::doe::fingerprint;
use agora_core::message::{
    abort_topic, explore_topic, prediction_broadcast_topic, prediction_topic,
};
use agora_core::op::{explore_to_json, parse_operating_point, prediction_to_json};
use agora_core::{
    ApplicationId, BlockDescription, Cluster, Doe, HandlerState, Message, PluginConfiguration,
    PluginKind, Prediction,
};
use agora_launcher::{Launcher, LauncherConfiguration, LauncherResult, PluginProcess};
use agora_storage::{BoxedStorage, StorageError, StorageResult};
use agora_transport::BoxedRemote;

/// Plugin the final predictions are computed with; fixed by convention.
const PREDICTION_PLUGIN_NAME: &str = "predict";

/// The shared collaborators a handler is built from.
#[derive(Clone)]
pub struct HandlerContext {
    /// The outbound message channel, shared across handlers.
    pub remote: BoxedRemote,
    /// The durable storage, shared across handlers.
    pub storage: BoxedStorage,
    /// Template for the plugin launchers of this handler.
    pub launcher_configuration: LauncherConfiguration,
}

/// The plugin launchers owned by one handler.
#[derive(Clone)]
struct PluginLaunchers {
    doe: Arc<Launcher>,
    cluster: Option<Arc<Launcher>>,
    prediction: Arc<Launcher>,
    /// Modelling launchers, one per distinct prediction plugin.
    models: BTreeMap<String, Arc<Launcher>>,
}

impl PluginLaunchers {
    fn all(&self) -> Vec<Arc<Launcher>> {
        let mut launchers = vec![Arc::clone(&self.doe), Arc::clone(&self.prediction)];
        if let Some(cluster) = &self.cluster {
            launchers.push(Arc::clone(cluster));
        }
        launchers.extend(self.models.values().cloned());
        launchers
    }
}

/// Everything guarded by the handler mutex.
struct HandlerInner {
    status: HandlerState,
    iteration_number: u64,
    configurations_per_iteration: u32,
    configurations_sent_per_iteration: u32,
    active_clients: HashSet<String>,
    description: Option<Arc<BlockDescription>>,
    doe: Doe,
    cluster: Cluster,
    prediction: Prediction,
    launchers: Option<PluginLaunchers>,
}

impl Default for HandlerInner {
    fn default() -> Self {
        Self {
            status: HandlerState::CLUELESS,
            iteration_number: 0,
            configurations_per_iteration: 0,
            configurations_sent_per_iteration: 0,
            active_clients: HashSet::new(),
            description: None,
            doe: Doe::default(),
            cluster: Cluster::default(),
            prediction: Prediction::default(),
            launchers: None,
        }
    }
}

/// The remote application handler.
pub struct RemoteApplicationHandler {
    app_id: ApplicationId,
    remote: BoxedRemote,
    storage: BoxedStorage,
    launcher_configuration: LauncherConfiguration,
    inner: Mutex<HandlerInner>,
}

impl RemoteApplicationHandler {
    /// Creates a handler in the `CLUELESS` state.
    pub fn new(app_id: ApplicationId, context: HandlerContext) -> Self {
        Self {
            app_id,
            remote: context.remote,
            storage: context.storage,
            launcher_configuration: context.launcher_configuration,
            inner: Mutex::new(HandlerInner::default()),
        }
    }

    /// The application this handler serves.
    pub fn app_id(&self) -> &ApplicationId {
        &self.app_id
    }

    /// The current state bits; observability and tests.
    pub async fn status(&self) -> HandlerState {
        self.inner.lock().await.status
    }

    /// How many clients are currently active.
    pub async fn active_client_count(&self) -> usize {
        self.inner.lock().await.active_clients.len()
    }

    /// The current iteration number.
    pub async fn iteration_number(&self) -> u64 {
        self.inner.lock().await.iteration_number
    }

    /// Handles a welcome message from a client.
    pub async fn welcome_client(&self, client_id: &str, info: &str) {
        let mut inner = self.inner.lock().await;
        inner.active_clients.insert(client_id.to_string());

        // The first client carries the application description.
        if inner.status.contains(HandlerState::CLUELESS) {
            let description = match parse_welcome(info, &self.app_id) {
                Ok(description) => Arc::new(description),
                Err(error) => {
                    warn!(
                        app_id = %self.app_id,
                        %error,
                        "couldn't find a matching application description, aborting"
                    );
                    return;
                }
            };

            info!(app_id = %self.app_id, "storing the description information");
            inner.configurations_per_iteration =
                description.agora.number_configurations_per_iteration;
            inner.description = Some(Arc::clone(&description));
            inner.status = HandlerState::WITH_INFORMATION;

            if let Err(error) = self
                .with_retry(|| self.storage.store_description(&self.app_id, &description))
                .await
            {
                error!(app_id = %self.app_id, %error, "unable to persist the description");
                inner.status = HandlerState::UNDEFINED;
            } else {
                match self.initialize_plugin_launchers(&description).await {
                    Ok(launchers) => {
                        inner.launchers = Some(launchers);
                        drop(inner);
                        if self.start_recovering().await {
                            // The recovered knowledge was already broadcast.
                            return;
                        }
                        inner = self.inner.lock().await;
                    }
                    Err(error) => {
                        error!(app_id = %self.app_id, %error, "unable to prepare the plugin workspaces");
                        inner.status = HandlerState::UNDEFINED;
                    }
                }
            }
        }

        // The state decides how the new client is served.
        if inner.status.contains(HandlerState::BUILDING_DOE) {
            info!("building a new doe, the client waits for a configuration to explore");
            return;
        }
        if inner
            .status
            .intersects(HandlerState::BUILDING_MODEL | HandlerState::BUILDING_CLUSTER)
        {
            info!("building models or clusters, the client waits for the outcome");
            return;
        }
        if inner.status.contains(HandlerState::BUILDING_PREDICTION) {
            info!("building predictions, the client waits for the application knowledge");
            return;
        }
        if inner.status.contains(HandlerState::RECOVERING) {
            info!("recovering data from storage, the client stands by");
            return;
        }
        if inner.status.contains(HandlerState::EXPLORING) {
            info!(client_id, "sending a new configuration to explore");
            self.send_configuration(&mut inner, client_id).await;
            return;
        }
        if inner.status.contains(HandlerState::WITH_PREDICTION) {
            info!(client_id, "sending the application knowledge to the new client");
            self.send_prediction(&inner, client_id).await;
            return;
        }
        if inner.status.contains(HandlerState::UNDEFINED) {
            info!(client_id, "undefined status, aborting the online autotuning procedure");
            self.send_abort(client_id).await;
        }
    }

    /// Handles a bye message (or broker-forwarded last will) from a client.
    pub async fn bye_client(&self, client_id: &str) {
        let mut inner = self.inner.lock().await;
        info!(app_id = %self.app_id, client_id, "terminating connection with client");
        inner.active_clients.remove(client_id);

        if !inner.active_clients.is_empty() {
            return;
        }
        if inner
            .status
            .intersects(HandlerState::BUILDING_ANY | HandlerState::RECOVERING)
        {
            debug!("last client left mid-build, keeping state until the pipeline settles");
            return;
        }

        info!(client_id, "was the last client, freeing up the memory");
        inner.status = HandlerState::CLUELESS;
        inner.doe.clear();
        inner.cluster.clear();
        inner.prediction.clear();
        inner.configurations_sent_per_iteration = 0;
    }

    /// Handles an observation from a client.
    pub async fn process_observation(
        &self,
        client_id: &str,
        seconds: i64,
        nanoseconds: i64,
        payload: &str,
    ) {
        let inner = self.inner.lock().await;
        if !Self::accepting_observations(inner.status) {
            warn!(
                app_id = %self.app_id,
                client_id,
                "the design space exploration is not running, ignoring the observation"
            );
            return;
        }
        let Some(description) = inner.description.clone() else {
            return;
        };
        drop(inner);

        let op = match parse_operating_point(payload, &description) {
            Ok(op) => op,
            Err(error) => {
                warn!(app_id = %self.app_id, %error, "parsing error, ignoring the observation");
                return;
            }
        };

        if let Err(error) = self
            .with_retry(|| {
                self.storage
                    .insert_observation(&self.app_id, client_id, seconds, nanoseconds, &op)
            })
            .await
        {
            self.storage_failure(&error).await;
            return;
        }

        let mut inner = self.inner.lock().await;
        // A bye or an iteration boundary may have slipped in while the
        // observation was persisted.
        if !Self::accepting_observations(inner.status) {
            warn!(client_id, "the exploration ended meanwhile, dropping the observation");
            return;
        }

        let observed = fingerprint(&op.knobs);
        if let Some(remaining) = inner.doe.record_observation(&observed) {
            if let Err(error) = self
                .with_retry(|| self.storage.update_doe_counter(&self.app_id, &observed, remaining))
                .await
            {
                drop(inner);
                self.storage_failure(&error).await;
                return;
            }
        }

        // Exploration path: more work for this client, no boundary yet.
        if inner.doe.is_valid()
            && inner.configurations_sent_per_iteration < inner.configurations_per_iteration
        {
            if !self.send_configuration(&mut inner, client_id).await {
                info!(client_id, "no configuration could be sent, the client is served next round");
            }
            return;
        }

        // Iteration boundary: train models (and clusters) on what we have.
        inner.iteration_number += 1;
        inner.configurations_sent_per_iteration = 0;
        let iteration = inner.iteration_number;
        let features_enabled = description.features_enabled();
        let Some(launchers) = inner.launchers.clone() else {
            inner.status = HandlerState::UNDEFINED;
            return;
        };

        info!(app_id = %self.app_id, iteration, "starting the modeling phase");
        inner.status.insert(HandlerState::BUILDING_MODEL);
        if features_enabled {
            info!("starting the clustering phase");
            inner.status.insert(HandlerState::BUILDING_CLUSTER);
        }
        drop(inner);

        self.run_build_phase(&description, &launchers, iteration).await;
        let models_valid = self.are_models_valid(&description).await;
        let cluster = if features_enabled {
            self.load_cluster_or_empty().await
        } else {
            Cluster::default()
        };

        let mut inner = self.inner.lock().await;
        inner
            .status
            .remove(HandlerState::BUILDING_MODEL | HandlerState::BUILDING_CLUSTER);
        if models_valid {
            inner.status = HandlerState::WITH_MODEL;
        }
        if features_enabled {
            inner.cluster = cluster;
            if inner.cluster.is_valid() {
                inner.status.insert(HandlerState::WITH_CLUSTER);
            }
        }

        // With usable models (and clusters) the knowledge can be computed.
        if models_valid && (!features_enabled || inner.cluster.is_valid()) {
            info!("starting the prediction phase");
            inner.status = HandlerState::BUILDING_PREDICTION;
            drop(inner);
            let prediction = self.run_prediction_plugin(&description, &launchers).await;
            inner = self.inner.lock().await;
            inner.status.remove(HandlerState::BUILDING_PREDICTION);
            inner.prediction = prediction;

            if inner.prediction.is_valid() {
                info!("the application knowledge has been retrieved");
                inner.status = HandlerState::WITH_PREDICTION;
                self.broadcast_prediction(&mut inner).await;
                return;
            }
            info!("the application knowledge was empty, restarting the design space exploration");
        }

        // More observations are needed; replan if the doe ran dry.
        if !inner.doe.is_valid() {
            info!("no more configurations available, running the doe generation once again");
            inner.status = HandlerState::BUILDING_DOE;
            drop(inner);
            let doe = self.run_doe_plugin(&description, &launchers).await;
            inner = self.inner.lock().await;
            inner.status.remove(HandlerState::BUILDING_DOE);
            inner.doe = doe;

            if !inner.doe.is_valid() {
                warn!(app_id = %self.app_id, "no configuration to explore");
                inner.status = HandlerState::UNDEFINED;
                return;
            }
        }

        inner.status = HandlerState::WITH_DOE | HandlerState::EXPLORING;
        info!(app_id = %self.app_id, "starting the design space exploration");

        // Fresh round: serve every client still around, within the cap.
        let clients: Vec<String> = inner.active_clients.iter().cloned().collect();
        for client in clients {
            if !self.send_configuration(&mut inner, &client).await {
                break;
            }
        }
    }

    /// Erases persisted data and clears every owned workspace; called once
    /// at process shutdown.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        info!(app_id = %self.app_id, "shutting down, erasing data and workspaces");

        if let Err(error) = self.storage.erase(&self.app_id).await {
            warn!(app_id = %self.app_id, %error, "unable to erase the application data");
        }
        if let Some(launchers) = inner.launchers.take() {
            for launcher in launchers.all() {
                if let Err(error) = launcher.clear_workspace().await {
                    warn!(
                        plugin = launcher.plugin_name(),
                        %error,
                        "unable to clear a plugin workspace"
                    );
                }
            }
        }
        inner.description = None;
        inner.doe.clear();
        inner.cluster.clear();
        inner.prediction.clear();
        inner.status = HandlerState::CLUELESS;
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Loads whatever previous data storage holds and fast-forwards the
    /// state machine accordingly. Returns `true` when the recovered (or
    /// freshly computed) knowledge was already broadcast, in which case
    /// the welcome path has nothing left to do.
    async fn start_recovering(&self) -> bool {
        let mut inner = self.inner.lock().await;
        info!(app_id = %self.app_id, "trying to recover data from storage first");
        inner.status = HandlerState::RECOVERING;
        let (Some(description), Some(launchers)) =
            (inner.description.clone(), inner.launchers.clone())
        else {
            inner.status = HandlerState::UNDEFINED;
            return false;
        };
        let features_enabled = description.features_enabled();
        drop(inner);

        // Bulk loads happen with the handler lock released.
        let doe = match self.with_retry(|| self.storage.load_doe(&self.app_id)).await {
            Ok(doe) => doe,
            Err(error) => {
                self.storage_failure(&error).await;
                return false;
            }
        };
        let prediction = match self
            .with_retry(|| self.storage.load_prediction(&self.app_id))
            .await
        {
            Ok(prediction) => prediction,
            Err(error) => {
                self.storage_failure(&error).await;
                return false;
            }
        };
        let cluster = if features_enabled {
            self.load_cluster_or_empty().await
        } else {
            Cluster::default()
        };
        let models_valid = self.are_models_valid(&description).await;

        let mut inner = self.inner.lock().await;
        inner.doe = doe;
        inner.prediction = prediction;
        inner.cluster = cluster;

        if inner.prediction.is_valid() {
            info!("recovered predictions from storage");
            inner.status = HandlerState::WITH_PREDICTION;
            self.broadcast_prediction(&mut inner).await;
            return true;
        }

        if models_valid && (!features_enabled || inner.cluster.is_valid()) {
            info!("recovered models from storage, starting the prediction phase");
            inner.status = HandlerState::WITH_MODEL | HandlerState::WITH_CLUSTER;
            inner.status = HandlerState::BUILDING_PREDICTION;
            drop(inner);
            let prediction = self.run_prediction_plugin(&description, &launchers).await;
            inner = self.inner.lock().await;
            inner.status.remove(HandlerState::BUILDING_PREDICTION);
            inner.prediction = prediction;

            if inner.prediction.is_valid() {
                info!("the application knowledge has been retrieved");
                inner.status = HandlerState::WITH_PREDICTION;
                self.broadcast_prediction(&mut inner).await;
                return true;
            }
            info!("the application knowledge was empty");
        }

        if inner.doe.is_valid() {
            info!("recovered doe configurations, restarting the design space exploration");
            inner.status = HandlerState::EXPLORING | HandlerState::WITH_DOE;
            return false;
        }

        info!("starting the doe building phase");
        inner.status = HandlerState::BUILDING_DOE;
        drop(inner);
        let doe = self.run_doe_plugin(&description, &launchers).await;
        inner = self.inner.lock().await;
        inner.status.remove(HandlerState::BUILDING_DOE);
        inner.doe = doe;

        if !inner.doe.is_valid() {
            warn!(app_id = %self.app_id, "the doe plugin couldn't produce anything");
            inner.status = HandlerState::UNDEFINED;
            return false;
        }

        info!("creating the observation container in storage");
        if let Err(error) = self
            .with_retry(|| self.storage.create_observation_table(&self.app_id, &description))
            .await
        {
            error!(app_id = %self.app_id, %error, "unable to create the observation container");
            inner.status = HandlerState::UNDEFINED;
            return false;
        }

        info!("starting the design space exploration");
        inner.status = HandlerState::WITH_DOE | HandlerState::EXPLORING;
        false
    }

    // ------------------------------------------------------------------
    // Plugin orchestration
    // ------------------------------------------------------------------

    async fn initialize_plugin_launchers(
        &self,
        description: &BlockDescription,
    ) -> LauncherResult<PluginLaunchers> {
        info!(app_id = %self.app_id, "initializing the plugin launchers");
        let configuration = &self.launcher_configuration;

        let doe_plugin = &description.agora.doe_plugin;
        let doe = Arc::new(
            Launcher::initialize(
                configuration,
                doe_plugin,
                &format!("doe_{doe_plugin}"),
                &self.app_id,
            )
            .await?,
        );

        let cluster = match (description.features_enabled(), &description.agora.clustering_plugin) {
            (true, Some(plugin)) => Some(Arc::new(
                Launcher::initialize(
                    configuration,
                    plugin,
                    &format!("cluster_{plugin}"),
                    &self.app_id,
                )
                .await?,
            )),
            _ => None,
        };

        let prediction = Arc::new(
            Launcher::initialize(
                configuration,
                PREDICTION_PLUGIN_NAME,
                PREDICTION_PLUGIN_NAME,
                &self.app_id,
            )
            .await?,
        );

        // One launcher per distinct modelling plugin across the metrics.
        let mut models = BTreeMap::new();
        for plugin in description.model_plugins() {
            let launcher = Launcher::initialize(
                configuration,
                &plugin,
                &format!("model_{plugin}"),
                &self.app_id,
            )
            .await?;
            models.insert(plugin, Arc::new(launcher));
        }

        Ok(PluginLaunchers {
            doe,
            cluster,
            prediction,
            models,
        })
    }

    async fn launch_plugin(
        &self,
        launcher: &Launcher,
        kind: PluginKind,
        configuration: &PluginConfiguration,
    ) -> LauncherResult<PluginProcess> {
        let env = self.storage.create_env_entries(kind, configuration);
        launcher.launch(&configuration.env_file_name, &env).await
    }

    /// Launches the modelling plugins (one per distinct prediction plugin)
    /// and, when features are enabled, the clustering plugin, then waits
    /// for all of them. Failures surface as missing artefacts downstream.
    async fn run_build_phase(
        &self,
        description: &BlockDescription,
        launchers: &PluginLaunchers,
        iteration: u64,
    ) {
        let mut launches: Vec<(Arc<Launcher>, PluginKind, PluginConfiguration)> = Vec::new();

        let mut metrics_by_plugin: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for metric in &description.metrics {
            metrics_by_plugin
                .entry(metric.prediction_plugin.as_str())
                .or_default()
                .push(metric.name.as_str());
        }
        for (plugin, metrics) in metrics_by_plugin {
            let Some(launcher) = launchers.models.get(plugin) else {
                continue;
            };
            let mut configuration = PluginConfiguration::for_metric(
                self.app_id.clone(),
                metrics.join(","),
                iteration,
            );
            configuration.properties = Self::base_properties(description);
            launches.push((Arc::clone(launcher), PluginKind::Model, configuration));
        }

        if description.features_enabled()
            && let Some(cluster_launcher) = &launchers.cluster
        {
            let mut configuration = PluginConfiguration::new(self.app_id.clone());
            configuration.properties = Self::base_properties(description);
            launches.push((
                Arc::clone(cluster_launcher),
                PluginKind::Cluster,
                configuration,
            ));
        }

        if self.storage.supports_concurrency() {
            let mut children = Vec::new();
            for (launcher, kind, configuration) in &launches {
                match self.launch_plugin(launcher, *kind, configuration).await {
                    Ok(process) => children.push(process),
                    Err(error) => {
                        warn!(plugin = launcher.plugin_name(), %error, "unable to start a plugin")
                    }
                }
            }
            for result in join_all(children.into_iter().map(PluginProcess::wait)).await {
                if let Err(error) = result {
                    warn!(%error, "a build plugin failed");
                }
            }
        } else {
            // The backend cannot take concurrent plugin traffic; serialise.
            for (launcher, kind, configuration) in &launches {
                match self.launch_plugin(launcher, *kind, configuration).await {
                    Ok(process) => {
                        if let Err(error) = process.wait().await {
                            warn!(%error, "a build plugin failed");
                        }
                    }
                    Err(error) => {
                        warn!(plugin = launcher.plugin_name(), %error, "unable to start a plugin")
                    }
                }
            }
        }
    }

    /// Runs the prediction plugin and loads whatever it produced.
    async fn run_prediction_plugin(
        &self,
        description: &BlockDescription,
        launchers: &PluginLaunchers,
    ) -> Prediction {
        let mut configuration = PluginConfiguration::new(self.app_id.clone());
        configuration.properties = Self::base_properties(description);

        match self
            .launch_plugin(&launchers.prediction, PluginKind::Prediction, &configuration)
            .await
        {
            Ok(process) => {
                if let Err(error) = process.wait().await {
                    warn!(%error, "the prediction plugin failed");
                }
            }
            Err(error) => warn!(%error, "unable to start the prediction plugin"),
        }

        match self
            .with_retry(|| self.storage.load_prediction(&self.app_id))
            .await
        {
            Ok(prediction) => prediction,
            Err(error) => {
                error!(%error, "unable to load the prediction");
                Prediction::default()
            }
        }
    }

    /// Runs the DoE plugin and loads whatever it produced.
    async fn run_doe_plugin(
        &self,
        description: &BlockDescription,
        launchers: &PluginLaunchers,
    ) -> Doe {
        let mut configuration = PluginConfiguration::new(self.app_id.clone());
        configuration.properties = Self::base_properties(description);

        match self
            .launch_plugin(&launchers.doe, PluginKind::Doe, &configuration)
            .await
        {
            Ok(process) => {
                if let Err(error) = process.wait().await {
                    warn!(%error, "the doe plugin failed");
                }
            }
            Err(error) => warn!(%error, "unable to start the doe plugin"),
        }

        match self.with_retry(|| self.storage.load_doe(&self.app_id)).await {
            Ok(doe) => doe,
            Err(error) => {
                error!(%error, "unable to load the doe");
                Doe::default()
            }
        }
    }

    /// The policy numbers and pass-through parameters every plugin
    /// receives through its env file.
    fn base_properties(description: &BlockDescription) -> BTreeMap<String, String> {
        let mut properties = BTreeMap::new();
        properties.insert(
            "NUMBER_CONFIGURATIONS_PER_ITERATION".to_string(),
            description
                .agora
                .number_configurations_per_iteration
                .to_string(),
        );
        properties.insert(
            "NUMBER_OBSERVATIONS_PER_CONFIGURATION".to_string(),
            description
                .agora
                .number_observations_per_configuration
                .to_string(),
        );
        for (key, value) in &description.agora.extra {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            properties.insert(key.to_uppercase(), rendered);
        }
        properties
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Observations are meaningful only while exploring and outside any
    /// build: the iteration boundary is a barrier, and samples of the
    /// previous plan are stale once training started.
    fn accepting_observations(status: HandlerState) -> bool {
        status.contains(HandlerState::EXPLORING) && !status.intersects(HandlerState::BUILDING_ANY)
    }

    async fn are_models_valid(&self, description: &BlockDescription) -> bool {
        for metric in &description.metrics {
            match self
                .with_retry(|| self.storage.is_model_valid(&self.app_id, &metric.name))
                .await
            {
                Ok(true) => {}
                Ok(false) => return false,
                Err(error) => {
                    warn!(metric = %metric.name, %error, "unable to check the model");
                    return false;
                }
            }
        }
        true
    }

    async fn load_cluster_or_empty(&self) -> Cluster {
        match self
            .with_retry(|| self.storage.load_cluster(&self.app_id))
            .await
        {
            Ok(cluster) => cluster,
            Err(error) => {
                warn!(%error, "unable to load the cluster");
                Cluster::default()
            }
        }
    }

    /// Sends the next configuration of the DoE cursor to `client_id`.
    /// Returns whether a configuration was actually sent; the per-iteration
    /// cap is enforced here, so it can never be exceeded.
    async fn send_configuration(&self, inner: &mut HandlerInner, client_id: &str) -> bool {
        let Some(description) = inner.description.clone() else {
            return false;
        };
        if inner.configurations_sent_per_iteration >= inner.configurations_per_iteration {
            debug!(client_id, "per-iteration cap reached, nothing sent");
            return false;
        }
        let Some(configuration) = inner.doe.next() else {
            return false;
        };

        let payload = explore_to_json(&description, &configuration);
        let message = Message::new(explore_topic(&self.app_id, client_id), payload);
        if let Err(error) = self.remote.send(message).await {
            warn!(client_id, %error, "unable to send a configuration");
        }
        inner.configurations_sent_per_iteration += 1;
        true
    }

    async fn send_prediction(&self, inner: &HandlerInner, client_id: &str) {
        let Some(description) = &inner.description else {
            return;
        };
        let payload = prediction_to_json(description, &inner.prediction);
        let message = Message::new(prediction_topic(&self.app_id, client_id), payload);
        if let Err(error) = self.remote.send(message).await {
            warn!(client_id, %error, "unable to send the prediction");
        }
    }

    async fn broadcast_prediction(&self, inner: &mut HandlerInner) {
        let Some(description) = inner.description.clone() else {
            return;
        };
        // A bye may have emptied the pool while a plugin was running.
        if inner.active_clients.is_empty() {
            debug!(app_id = %self.app_id, "no active clients, skipping the broadcast");
            return;
        }
        let payload = prediction_to_json(&description, &inner.prediction);
        let message = Message::new(prediction_broadcast_topic(&self.app_id), payload);
        if let Err(error) = self.remote.send(message).await {
            warn!(%error, "unable to broadcast the application knowledge");
        }
    }

    async fn send_abort(&self, client_id: &str) {
        let message = Message::new(abort_topic(&self.app_id, client_id), "");
        if let Err(error) = self.remote.send(message).await {
            warn!(client_id, %error, "unable to send the abort notification");
        }
    }

    /// Retries a storage operation once when the failure looks transient.
    async fn with_retry<T, F, Fut>(&self, operation: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        match operation().await {
            Err(error) if error.is_transient() => {
                warn!(%error, "transient storage error, retrying once");
                operation().await
            }
            other => other,
        }
    }

    /// A storage failure the retry did not absorb: the pipeline of this
    /// application cannot progress.
    async fn storage_failure(&self, error: &StorageError) {
        error!(app_id = %self.app_id, %error, "persistent storage failure");
        self.inner.lock().await.status = HandlerState::UNDEFINED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::doe::Configuration;
    use agora_storage::FsStorage;
    use agora_transport::{RemoteHandler, TransportResult};
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    /// Captures everything the handler publishes.
    struct RecordingRemote {
        sent: StdMutex<Vec<Message>>,
    }

    impl RecordingRemote {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteHandler for RecordingRemote {
        async fn subscribe(&self, _topic: &str) -> TransportResult<()> {
            Ok(())
        }

        async fn unsubscribe(&self, _topic: &str) -> TransportResult<()> {
            Ok(())
        }

        async fn send(&self, message: Message) -> TransportResult<()> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn recv(&self) -> Option<Message> {
            None
        }

        async fn disconnect(&self) {}

        fn client_id(&self) -> &str {
            "recording"
        }
    }

    fn aid() -> ApplicationId {
        ApplicationId::new("app", "v1", "blk")
    }

    fn welcome_payload(configurations_per_iteration: u32) -> String {
        json!({
            "name": "app",
            "version": "v1",
            "blocks": [{
                "name": "blk",
                "knobs": [{"name": "k", "type": "int", "values": [1, 2]}],
                "metrics": [{"name": "m", "type": "int", "prediction_plugin": "model"}],
                "agora": {
                    "doe_plugin": "doe",
                    "number_configurations_per_iteration": configurations_per_iteration
                }
            }]
        })
        .to_string()
    }

    /// Plugin directories that can be copied but never executed; tests
    /// below only exercise paths that run no plugin.
    fn seed_plugin_dirs(root: &Path) {
        for name in ["doe", "model", "predict"] {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("asset.txt"), name).unwrap();
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        remote: Arc<RecordingRemote>,
        storage: Arc<FsStorage>,
        handler: RemoteApplicationHandler,
    }

    fn fixture(with_plugins: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let plugin_root = dir.path().join("plugins");
        if with_plugins {
            seed_plugin_dirs(&plugin_root);
        }
        let remote = RecordingRemote::new();
        let storage = Arc::new(FsStorage::open(dir.path().join("storage")).unwrap());
        let handler = RemoteApplicationHandler::new(
            aid(),
            HandlerContext {
                remote: Arc::clone(&remote) as BoxedRemote,
                storage: Arc::clone(&storage) as BoxedStorage,
                launcher_configuration: LauncherConfiguration::new(
                    plugin_root,
                    dir.path().join("workspaces"),
                ),
            },
        );
        Fixture {
            _dir: dir,
            remote,
            storage,
            handler,
        }
    }

    fn config(v: &str) -> Configuration {
        [("k".to_string(), v.to_string())].into()
    }

    async fn seed_doe(storage: &FsStorage, counter: u32) {
        let doe = Doe::new([config("1"), config("2")], counter);
        storage.store_doe(&aid(), &doe).await.unwrap();
    }

    use agora_storage::Storage;

    #[tokio::test]
    async fn unparsable_welcome_keeps_the_handler_clueless() {
        let fixture = fixture(true);
        fixture.handler.welcome_client("c1", "not json at all").await;

        assert_eq!(fixture.handler.status().await, HandlerState::CLUELESS);
        assert_eq!(fixture.handler.active_client_count().await, 1);
        assert!(fixture.remote.sent().is_empty());
    }

    #[tokio::test]
    async fn persisted_doe_resumes_exploration_without_replanning() {
        let fixture = fixture(true);
        seed_doe(&fixture.storage, 1).await;

        fixture.handler.welcome_client("c1", &welcome_payload(2)).await;

        let status = fixture.handler.status().await;
        assert!(status.contains(HandlerState::EXPLORING | HandlerState::WITH_DOE));

        let sent = fixture.remote.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "margot/app^v1^blk/c1/explore");
        assert!(sent[0].payload.contains("\"k\":1"));
    }

    #[tokio::test]
    async fn the_per_iteration_cap_bounds_welcome_dispatch() {
        let fixture = fixture(true);
        seed_doe(&fixture.storage, 5).await;

        fixture.handler.welcome_client("c1", &welcome_payload(1)).await;
        fixture.handler.welcome_client("c2", &welcome_payload(1)).await;

        // Cap of one: the second welcome gets nothing this iteration.
        let explores = fixture
            .remote
            .sent()
            .iter()
            .filter(|m| m.topic.ends_with("/explore"))
            .count();
        assert_eq!(explores, 1);
    }

    #[tokio::test]
    async fn observations_outside_exploration_are_dropped() {
        let fixture = fixture(true);
        // No welcome at all: the handler is clueless, not exploring.
        fixture
            .handler
            .process_observation(
                "c1",
                100,
                0,
                &json!({"blk": [{"knobs": {"k": 1}, "metrics": {"m": 42}}]}).to_string(),
            )
            .await;

        assert!(fixture.remote.sent().is_empty());
        assert_eq!(fixture.handler.status().await, HandlerState::CLUELESS);
    }

    #[tokio::test]
    async fn exploration_advances_through_the_doe() {
        let fixture = fixture(true);
        seed_doe(&fixture.storage, 1).await;
        fixture.handler.welcome_client("c1", &welcome_payload(2)).await;

        let op = json!({"blk": [{"knobs": {"k": 1}, "metrics": {"m": 42}}]}).to_string();
        fixture.handler.process_observation("c1", 100, 0, &op).await;

        let sent = fixture.remote.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].payload.contains("\"k\":2"));

        // The counter decrement reached storage.
        let doe = fixture.storage.load_doe(&aid()).await.unwrap();
        assert!(!doe.required_explorations.contains_key("k=1"));
        assert!(doe.required_explorations.contains_key("k=2"));
    }

    #[tokio::test]
    async fn recovery_hit_broadcasts_and_launches_nothing() {
        let fixture = fixture(true);
        let prediction = Prediction {
            rows: vec![agora_core::PredictionRow {
                configuration: config("2"),
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
        fixture
            .storage
            .store_prediction(&aid(), &prediction)
            .await
            .unwrap();

        fixture.handler.welcome_client("c1", &welcome_payload(2)).await;

        assert_eq!(
            fixture.handler.status().await,
            HandlerState::WITH_PREDICTION
        );
        let sent = fixture.remote.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "margot/app^v1^blk/prediction");
        assert!(sent[0].payload.contains("\"m\":42"));

        // A second welcome is served the knowledge unicast.
        fixture.handler.welcome_client("c2", &welcome_payload(2)).await;
        let sent = fixture.remote.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].topic, "margot/app^v1^blk/c2/prediction");
    }

    #[tokio::test]
    async fn bye_last_client_resets_but_keeps_description_and_launchers() {
        let fixture = fixture(true);
        seed_doe(&fixture.storage, 1).await;
        fixture.handler.welcome_client("c1", &welcome_payload(2)).await;
        assert!(
            fixture
                .handler
                .status()
                .await
                .contains(HandlerState::EXPLORING)
        );

        fixture.handler.bye_client("c1").await;
        assert_eq!(fixture.handler.status().await, HandlerState::CLUELESS);
        assert_eq!(fixture.handler.active_client_count().await, 0);

        // The persisted plan survives; a new welcome resumes from it.
        fixture.handler.welcome_client("c2", &welcome_payload(2)).await;
        assert!(
            fixture
                .handler
                .status()
                .await
                .contains(HandlerState::EXPLORING)
        );
    }

    #[tokio::test]
    async fn missing_plugins_escalate_to_undefined_and_abort_welcomers() {
        // No plugin directories at all: workspace preparation fails.
        let fixture = fixture(false);
        fixture.handler.welcome_client("c1", &welcome_payload(2)).await;

        assert_eq!(fixture.handler.status().await, HandlerState::UNDEFINED);
        let sent = fixture.remote.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "margot/app^v1^blk/c1/abort");

        fixture.handler.welcome_client("c2", &welcome_payload(2)).await;
        let sent = fixture.remote.sent();
        assert_eq!(sent[1].topic, "margot/app^v1^blk/c2/abort");
    }

    #[tokio::test]
    async fn recovered_models_without_knowledge_fall_back_to_replanning() {
        let fixture = fixture(true);
        // Valid model, no prediction, no doe: recovery must try the
        // prediction plugin, fail (the stub tree has no script), replan,
        // fail again and give up.
        fixture
            .storage
            .store_model(&aid(), "m", &json!({"valid": true}))
            .await
            .unwrap();

        fixture.handler.welcome_client("c1", &welcome_payload(2)).await;

        assert_eq!(fixture.handler.status().await, HandlerState::UNDEFINED);
        let sent = fixture.remote.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "margot/app^v1^blk/c1/abort");
    }

    #[tokio::test]
    async fn shutdown_erases_data_and_clears_workspaces() {
        let fixture = fixture(true);
        seed_doe(&fixture.storage, 1).await;
        fixture.handler.welcome_client("c1", &welcome_payload(2)).await;

        let workspace_root = fixture._dir.path().join("workspaces").join("app^v1^blk");
        for label in ["doe_doe", "model_model", "predict"] {
            assert!(workspace_root.join(label).is_dir());
        }

        fixture.handler.shutdown().await;
        for label in ["doe_doe", "model_model", "predict"] {
            assert!(!workspace_root.join(label).exists());
        }
        assert!(
            fixture
                .storage
                .load_description(&aid())
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(fixture.handler.status().await, HandlerState::CLUELESS);
    }
}
