//! The process-wide application registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use agora_core::ApplicationId;

use crate::handler::{HandlerContext, RemoteApplicationHandler};

/// Lazy map from application identifier to its live handler.
///
/// Handlers are created on the first inbound message referencing their
/// application and destroyed only at process shutdown. The registry also
/// owns the process-wide collaborators handed to every handler.
pub struct ApplicationRegistry {
    handlers: RwLock<HashMap<ApplicationId, Arc<RemoteApplicationHandler>>>,
    context: HandlerContext,
}

impl ApplicationRegistry {
    /// Creates an empty registry around the shared collaborators.
    pub fn new(context: HandlerContext) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            context,
        }
    }

    /// Returns the handler for `app_id`, constructing it on first use.
    pub async fn get_or_create(&self, app_id: &ApplicationId) -> Arc<RemoteApplicationHandler> {
        if let Some(handler) = self.handlers.read().await.get(app_id) {
            return Arc::clone(handler);
        }

        let mut handlers = self.handlers.write().await;
        // Another worker may have won the race between the two locks.
        if let Some(handler) = handlers.get(app_id) {
            return Arc::clone(handler);
        }

        info!(%app_id, "creating a new application handler");
        let handler = Arc::new(RemoteApplicationHandler::new(
            app_id.clone(),
            self.context.clone(),
        ));
        handlers.insert(app_id.clone(), Arc::clone(&handler));
        handler
    }

    /// Returns the handler for `app_id`, if one exists.
    pub async fn get(&self, app_id: &ApplicationId) -> Option<Arc<RemoteApplicationHandler>> {
        self.handlers.read().await.get(app_id).cloned()
    }

    /// The identifiers of every live handler.
    pub async fn ids(&self) -> Vec<ApplicationId> {
        self.handlers.read().await.keys().cloned().collect()
    }

    /// Number of live handlers.
    pub async fn count(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Removes and shuts down one handler. Not used during normal
    /// operation; applications live until process shutdown.
    pub async fn erase(&self, app_id: &ApplicationId) {
        let handler = self.handlers.write().await.remove(app_id);
        if let Some(handler) = handler {
            handler.shutdown().await;
        }
    }

    /// Shuts every handler down: waits out in-flight work, erases persisted
    /// data and clears plugin workspaces.
    pub async fn shutdown(&self) {
        let handlers: Vec<_> = {
            let mut map = self.handlers.write().await;
            map.drain().collect()
        };
        info!("shutting down {} application handler(s)", handlers.len());

        for (app_id, handler) in handlers {
            debug!(%app_id, "shutting down handler");
            handler.shutdown().await;
        }
    }
}
