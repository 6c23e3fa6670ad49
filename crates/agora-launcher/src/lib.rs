//! External plugin execution.
//!
//! A plugin is a directory under the plugin root containing a `plugin.sh`
//! script plus assets. Each [`Launcher`] owns one per-`(plugin,
//! application)` workspace: the plugin tree is copied there once, every
//! launch writes a fresh env file into it and spawns the script as a child
//! process, and the workspace is removed when the owning handler shuts
//! down.
//!
//! Plugins are third-party executables; isolation comes from the child
//! process boundary, never from in-process threads.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use agora_core::ApplicationId;

/// Errors produced while preparing or running a plugin.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// A filesystem operation on the workspace failed.
    #[error("launcher I/O error on '{path}': {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The plugin script could not be spawned.
    #[error("unable to spawn plugin script '{script}': {source}")]
    Spawn {
        /// The script path.
        script: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },

    /// The plugin process exited with a nonzero status.
    #[error("plugin '{plugin}' failed with exit status {code:?}")]
    PluginFailure {
        /// The plugin name.
        plugin: String,
        /// The exit code, when the process was not killed by a signal.
        code: Option<i32>,
    },
}

/// Result type for launcher operations.
pub type LauncherResult<T> = Result<T, LauncherError>;

/// Filesystem coordinates shared by every launcher of the process.
#[derive(Debug, Clone)]
pub struct LauncherConfiguration {
    /// Root directory holding one subdirectory per available plugin.
    pub plugin_root: PathBuf,
    /// Root directory the per-application workspaces are created under.
    pub workspace_root: PathBuf,
    /// Name of the executable script inside a plugin directory.
    pub script_name: String,
}

impl LauncherConfiguration {
    /// Creates a configuration with the conventional `plugin.sh` script
    /// name.
    pub fn new(plugin_root: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            plugin_root: plugin_root.into(),
            workspace_root: workspace_root.into(),
            script_name: "plugin.sh".to_string(),
        }
    }
}

fn io_err(path: &Path, source: io::Error) -> LauncherError {
    LauncherError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Recursive copy of the plugin tree, iterative to keep the future `Send`.
async fn copy_tree(source: &Path, destination: &Path) -> LauncherResult<()> {
    let mut stack = vec![(source.to_path_buf(), destination.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to)
            .await
            .map_err(|e| io_err(&to, e))?;
        let mut entries = tokio::fs::read_dir(&from)
            .await
            .map_err(|e| io_err(&from, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(&from, e))? {
            let target = to.join(entry.file_name());
            let file_type = entry.file_type().await.map_err(|e| io_err(&entry.path(), e))?;
            if file_type.is_dir() {
                stack.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target)
                    .await
                    .map_err(|e| io_err(&entry.path(), e))?;
            }
        }
    }
    Ok(())
}

/// A running plugin child process.
pub struct PluginProcess {
    plugin: String,
    child: Child,
}

impl PluginProcess {
    /// The OS process id, when the child is still running.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Waits for the plugin to complete. Success iff the exit status is
    /// zero; anything else surfaces as
    /// [`LauncherError::PluginFailure`].
    pub async fn wait(mut self) -> LauncherResult<()> {
        let status = self.child.wait().await.map_err(|e| LauncherError::Spawn {
            script: PathBuf::from(&self.plugin),
            source: e,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(LauncherError::PluginFailure {
                plugin: self.plugin,
                code: status.code(),
            })
        }
    }
}

/// One plugin's launch pad for one application.
pub struct Launcher {
    plugin_name: String,
    script_name: String,
    workspace: PathBuf,
}

impl Launcher {
    /// Creates the launcher and prepares its workspace by copying the
    /// plugin tree from the plugin root.
    ///
    /// `workspace_label` names the workspace under the application
    /// directory; launchers owned by the same handler must use distinct
    /// labels even when they run the same plugin.
    pub async fn initialize(
        configuration: &LauncherConfiguration,
        plugin_name: &str,
        workspace_label: &str,
        app_id: &ApplicationId,
    ) -> LauncherResult<Self> {
        let source = configuration.plugin_root.join(plugin_name);
        let workspace = configuration
            .workspace_root
            .join(app_id.to_string())
            .join(workspace_label);

        copy_tree(&source, &workspace).await?;
        debug!(plugin = plugin_name, workspace = %workspace.display(), "workspace initialized");

        Ok(Self {
            plugin_name: plugin_name.to_string(),
            script_name: configuration.script_name.clone(),
            workspace,
        })
    }

    /// The plugin this launcher runs.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// The workspace this launcher owns.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Writes a fresh env file into the workspace and spawns the plugin
    /// script with the file as its argument.
    pub async fn launch(&self, env_file_name: &str, env: &[(String, String)]) -> LauncherResult<PluginProcess> {
        let env_path = self.workspace.join(env_file_name);
        let mut content = String::new();
        for (key, value) in env {
            content.push_str(key);
            content.push_str("=\"");
            content.push_str(value);
            content.push_str("\"\n");
        }
        tokio::fs::write(&env_path, content)
            .await
            .map_err(|e| io_err(&env_path, e))?;

        let script = self.workspace.join(&self.script_name);
        let child = Command::new(&script)
            .arg(&env_path)
            .current_dir(&self.workspace)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LauncherError::Spawn {
                script: script.clone(),
                source: e,
            })?;

        info!(
            plugin = %self.plugin_name,
            pid = child.id(),
            "plugin process started"
        );
        Ok(PluginProcess {
            plugin: self.plugin_name.clone(),
            child,
        })
    }

    /// Removes the workspace. Idempotent; called on every handler exit
    /// path.
    pub async fn clear_workspace(&self) -> LauncherResult<()> {
        match tokio::fs::remove_dir_all(&self.workspace).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&self.workspace, e)),
        }
    }
}
