//! The `agora` binary: CLI parsing, configuration merge and runtime
//! startup.
//!
//! Exit codes: `0` clean shutdown, `1` invalid argument or configuration,
//! `2` fatal startup failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::error::ErrorKind;
use tracing::error;

use agora_runtime::{
    AgoraConfig, AgoraRuntime, LogLevel, LoggingBuilder, load_config,
    config::load_config_from_file,
};

#[derive(Debug, Parser)]
#[command(name = "agora", version, about = "Online autotuning orchestrator")]
struct Cli {
    /// Path to a configuration file (defaults to searching for agora.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Folder with all the available plugins.
    #[arg(long)]
    plugin_folder: Option<PathBuf>,

    /// Folder the per-application plugin workspaces are created under.
    #[arg(long)]
    workspace_folder: Option<PathBuf>,

    /// Root of the storage tree.
    #[arg(long)]
    storage_root: Option<PathBuf>,

    /// Storage backend implementation (only `fs` ships in-tree).
    #[arg(long)]
    storage_backend: Option<String>,

    /// Endpoint of the message broker.
    #[arg(long)]
    broker_url: Option<String>,

    /// Username for broker authentication.
    #[arg(long)]
    broker_username: Option<String>,

    /// Password for broker authentication.
    #[arg(long)]
    broker_password: Option<String>,

    /// Quality-of-service level requested from the broker [0-2].
    #[arg(long)]
    qos: Option<u8>,

    /// Minimum level of logging
    /// (disabled, warning, info, pedantic, debug).
    #[arg(long)]
    min_log_level: Option<LogLevel>,

    /// Number of workers processing messages; at least one per managed
    /// application is recommended.
    #[arg(long)]
    threads: Option<usize>,
}

impl Cli {
    fn apply(self, configuration: &mut AgoraConfig) {
        if let Some(plugin_folder) = self.plugin_folder {
            configuration.plugins.root = plugin_folder;
        }
        if let Some(workspace_folder) = self.workspace_folder {
            configuration.plugins.workspace = workspace_folder;
        }
        if let Some(storage_root) = self.storage_root {
            configuration.storage.root = storage_root;
        }
        if let Some(storage_backend) = self.storage_backend {
            configuration.storage.backend = storage_backend;
        }
        if let Some(broker_url) = self.broker_url {
            configuration.broker.url = broker_url;
        }
        if let Some(broker_username) = self.broker_username {
            configuration.broker.username = Some(broker_username);
        }
        if let Some(broker_password) = self.broker_password {
            configuration.broker.password = Some(broker_password);
        }
        if let Some(qos) = self.qos {
            configuration.broker.qos = qos;
        }
        if let Some(min_log_level) = self.min_log_level {
            configuration.runtime.log_level = min_log_level;
        }
        if let Some(threads) = self.threads {
            configuration.runtime.workers = threads;
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let _ = error.print();
            return match error.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::from(1),
            };
        }
    };

    let loaded = match &cli.config {
        Some(path) => load_config_from_file(path),
        None => load_config(),
    };
    let mut configuration = match loaded {
        Ok(configuration) => configuration,
        Err(error) => {
            eprintln!("error: {error}");
            return ExitCode::from(1);
        }
    };
    cli.apply(&mut configuration);

    if configuration.broker.qos > 2 {
        eprintln!("error: qos must be within 0..=2");
        return ExitCode::from(1);
    }
    if configuration.runtime.workers == 0 {
        eprintln!("error: at least one worker is required");
        return ExitCode::from(1);
    }
    if configuration.storage.backend != "fs" {
        eprintln!(
            "error: unknown storage backend '{}'",
            configuration.storage.backend
        );
        return ExitCode::from(1);
    }

    LoggingBuilder::new()
        .with_filter(configuration.runtime.log_level.as_filter())
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("fatal: cannot start the async runtime: {error}");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(async {
        let (_broker, agora) = match AgoraRuntime::with_loopback(configuration) {
            Ok(wired) => wired,
            Err(error) => {
                error!(%error, "fatal startup failure");
                return ExitCode::from(2);
            }
        };
        match agora.run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(error) => {
                error!(%error, "fatal startup failure");
                ExitCode::from(2)
            }
        }
    })
}
