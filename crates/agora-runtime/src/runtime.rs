//! Runtime orchestration: wiring, startup and orderly shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tracing::info;

use agora_core::message::MESSAGE_ROOT;
use agora_core::Inbox;
use agora_launcher::LauncherConfiguration;
use agora_storage::{BoxedStorage, FsStorage};
use agora_transport::loopback::{LoopbackBroker, LoopbackClient};
use agora_transport::{BoxedRemote, RemoteConfiguration};

use crate::config::AgoraConfig;
use crate::handler::HandlerContext;
use crate::registry::ApplicationRegistry;
use crate::worker::spawn_workers;

/// The assembled orchestrator.
///
/// ```rust,ignore
/// let configuration = load_config()?;
/// let (_broker, runtime) = AgoraRuntime::with_loopback(configuration)?;
/// runtime.run().await?;
/// ```
pub struct AgoraRuntime {
    configuration: AgoraConfig,
    remote: BoxedRemote,
    registry: Arc<ApplicationRegistry>,
}

impl AgoraRuntime {
    /// Wires a runtime from an already connected remote adapter and an
    /// opened storage backend.
    pub fn new(configuration: AgoraConfig, remote: BoxedRemote, storage: BoxedStorage) -> Self {
        let launcher_configuration = LauncherConfiguration {
            plugin_root: configuration.plugins.root.clone(),
            workspace_root: configuration.plugins.workspace.clone(),
            script_name: configuration.plugins.script_name.clone(),
        };
        let registry = Arc::new(ApplicationRegistry::new(HandlerContext {
            remote: Arc::clone(&remote),
            storage,
            launcher_configuration,
        }));
        Self {
            configuration,
            remote,
            registry,
        }
    }

    /// Wires a runtime around an in-process broker, returning the broker so
    /// clients of the same process can attach to it.
    ///
    /// Failing to open the storage root is a fatal startup error.
    pub fn with_loopback(
        configuration: AgoraConfig,
    ) -> anyhow::Result<(Arc<LoopbackBroker>, Self)> {
        let storage = Arc::new(
            FsStorage::open(&configuration.storage.root)
                .context("cannot open the storage root")?,
        );

        let broker = LoopbackBroker::new();
        let remote_configuration = RemoteConfiguration {
            broker_url: configuration.broker.url.clone(),
            username: configuration.broker.username.clone(),
            password: configuration.broker.password.clone(),
            qos: configuration.broker.qos,
            app_identifier: "agora".to_string(),
        };
        let remote = LoopbackClient::connect(
            Arc::clone(&broker),
            &remote_configuration,
            Arc::new(Inbox::default()),
        );

        let runtime = Self::new(configuration, remote, storage);
        Ok((broker, runtime))
    }

    /// The shared registry; observability and tests.
    pub fn registry(&self) -> &Arc<ApplicationRegistry> {
        &self.registry
    }

    /// The remote adapter this runtime publishes through.
    pub fn remote(&self) -> &BoxedRemote {
        &self.remote
    }

    /// Subscribes to the core inbound topics.
    async fn subscribe_core_topics(&self) -> anyhow::Result<()> {
        for topic in [
            format!("{MESSAGE_ROOT}/+/+/welcome"),
            format!("{MESSAGE_ROOT}/+/+/kia"),
            format!("{MESSAGE_ROOT}/+/+/observation"),
            format!("{MESSAGE_ROOT}/system"),
        ] {
            self.remote
                .subscribe(&topic)
                .await
                .with_context(|| format!("cannot subscribe to '{topic}'"))?;
        }
        Ok(())
    }

    /// Runs until a shutdown signal or a `margot/system shutdown` message
    /// arrives, then drains the workers and tears everything down.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.subscribe_core_topics().await?;

        let workers = spawn_workers(
            self.configuration.runtime.workers,
            Arc::clone(&self.remote),
            Arc::clone(&self.registry),
        );
        info!(
            workers = self.configuration.runtime.workers,
            "agora is up, waiting for clients"
        );

        let mut drained = Box::pin(futures::future::join_all(workers));
        tokio::select! {
            signal = Self::wait_for_signal() => {
                signal?;
                info!("shutdown signal received");
                self.remote.disconnect().await;
                drained.await;
            }
            // A system shutdown message already disconnected the adapter
            // and let the workers drain on their own.
            _ = &mut drained => {}
        }

        self.registry.shutdown().await;
        info!("clean shutdown");
        Ok(())
    }

    /// Waits for Ctrl+C or, on unix, SIGTERM.
    async fn wait_for_signal() -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .context("cannot register the SIGTERM handler")?;
            tokio::select! {
                result = signal::ctrl_c() => result.context("cannot listen for Ctrl+C")?,
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await.context("cannot listen for Ctrl+C")?;
        }

        Ok(())
    }
}
