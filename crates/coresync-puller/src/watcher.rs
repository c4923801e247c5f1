//! Coordination watcher: turns core ownership notifications into pulls.
//!
//! The cluster coordination layer publishes [`CoreNotification`]s on a
//! broadcast channel. [`CoreWatcher`] subscribes and:
//! - On `Assigned`: enqueues a pull so the new core is brought up to date.
//! - On `Updated`: enqueues a pull for at least the announced generation.
//! - On `Removed`: drops queued work and generation tracking for the core.

use std::sync::Arc;

use coresync_lease::ConcurrencyController;
use coresync_types::{CoreIdentity, Generation};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::feeder::PullerFeeder;

/// A change in which cores this node serves, or in their remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreNotification {
    /// This node now serves `core`.
    Assigned(CoreIdentity),
    /// Another node pushed a new generation of `core`.
    Updated {
        /// The pushed core.
        core: CoreIdentity,
        /// The new remote generation.
        generation: Generation,
    },
    /// This node no longer serves `core`.
    Removed(CoreIdentity),
}

/// Feeds coordination notifications into the pull queue.
pub struct CoreWatcher {
    feeder: Arc<PullerFeeder>,
    controller: Arc<ConcurrencyController>,
}

impl CoreWatcher {
    /// Create a watcher feeding `feeder`.
    pub fn new(feeder: Arc<PullerFeeder>, controller: Arc<ConcurrencyController>) -> Self {
        Self { feeder, controller }
    }

    /// Process notifications until the channel closes or `shutdown` fires.
    pub async fn run(
        &self,
        mut notifications: broadcast::Receiver<CoreNotification>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("core watcher started");
        loop {
            tokio::select! {
                received = notifications.recv() => match received {
                    Ok(notification) => self.handle(notification),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "core watcher lagged behind notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("core watcher stopping, notification channel closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("core watcher stopping");
                    break;
                }
            }
        }
    }

    /// Apply a single notification.
    pub fn handle(&self, notification: CoreNotification) {
        match notification {
            CoreNotification::Assigned(core) => {
                debug!(%core, "core assigned");
                let known = self
                    .controller
                    .current_generation(&core)
                    .unwrap_or(Generation::ZERO);
                self.feeder.enqueue(&core, known);
            }
            CoreNotification::Updated { core, generation } => {
                debug!(%core, %generation, "core updated remotely");
                self.feeder.enqueue(&core, generation);
            }
            CoreNotification::Removed(core) => {
                debug!(%core, "core removed");
                self.feeder.queue().remove(&core);
                self.controller.forget(&core);
            }
        }
    }
}
