//! The worker pool draining the inbox.
//!
//! Workers are peers: any worker may serve any application. Two workers
//! handling messages for the same application serialise inside its
//! handler; different applications proceed in parallel.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use agora_core::message::{SHUTDOWN_COMMAND, SYSTEM_TOPIC};
use agora_core::op::split_observation;
use agora_core::topic::{RoutedMessage, TopicKind, route};
use agora_core::Message;
use agora_transport::BoxedRemote;

use crate::registry::ApplicationRegistry;

/// Spawns `count` workers, each looping on `remote.recv()` until the
/// channel is terminated and drained.
pub fn spawn_workers(
    count: usize,
    remote: BoxedRemote,
    registry: Arc<ApplicationRegistry>,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|index| {
            let remote = Arc::clone(&remote);
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                info!(worker = index, "worker on duty");
                while let Some(message) = remote.recv().await {
                    handle_message(&remote, &registry, message).await;
                }
                info!(worker = index, "worker on retirement");
            })
        })
        .collect()
}

/// Dispatches one inbound message to the matching handler method.
pub async fn handle_message(
    remote: &BoxedRemote,
    registry: &Arc<ApplicationRegistry>,
    message: Message,
) {
    // System commands come first: they do not address an application.
    if message.topic == SYSTEM_TOPIC {
        if message.payload == SHUTDOWN_COMMAND {
            info!("shutdown command received, tearing the channel down");
            remote.disconnect().await;
        } else {
            warn!(command = %message.payload, "unknown system command, ignoring");
        }
        return;
    }

    let routed = match route(&message.topic) {
        Ok(routed) => routed,
        Err(error) => {
            warn!(topic = %message.topic, %error, "dropping an unroutable message");
            return;
        }
    };

    match routed.kind {
        TopicKind::Welcome => {
            if let Some((app_id, client_id)) = addressed(&routed) {
                debug!(%app_id, client_id, "new client welcome");
                let handler = registry.get_or_create(&app_id).await;
                handler.welcome_client(&client_id, &message.payload).await;
            }
        }
        TopicKind::Kia => {
            if let Some((app_id, client_id)) = addressed(&routed) {
                debug!(%app_id, client_id, "client leaving");
                let handler = registry.get_or_create(&app_id).await;
                handler.bye_client(&client_id).await;
            }
        }
        TopicKind::Observation => {
            if let Some((app_id, client_id)) = addressed(&routed) {
                match split_observation(&message.payload) {
                    Ok((seconds, nanoseconds, op)) => {
                        let handler = registry.get_or_create(&app_id).await;
                        handler
                            .process_observation(&client_id, seconds, nanoseconds, op)
                            .await;
                    }
                    Err(error) => {
                        warn!(%app_id, client_id, %error, "dropping a malformed observation");
                    }
                }
            }
        }
        TopicKind::Disconnect => {
            // The transport re-establishes subscriptions on reconnection;
            // the pool only surfaces the event.
            warn!(cause = %message.payload, "transport connection lost");
        }
        TopicKind::Error => {
            warn!(reason = %message.payload, "message rejected by the sanitiser");
        }
        TopicKind::Explore | TopicKind::Prediction | TopicKind::Abort | TopicKind::System => {
            // Outbound kinds looping back through a catch-all subscription.
            debug!(topic = %message.topic, "ignoring an outbound message kind");
        }
    }
}

fn addressed(routed: &RoutedMessage) -> Option<(agora_core::ApplicationId, String)> {
    match (&routed.app_id, &routed.client_id) {
        (Some(app_id), Some(client_id)) => Some((app_id.clone(), client_id.clone())),
        _ => {
            warn!(kind = %routed.kind, "message misses its addressing segments, dropping");
            None
        }
    }
}
