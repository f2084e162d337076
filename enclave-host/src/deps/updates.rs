//! Periodic checks for newer versions of loaded npm libraries.

use super::manager::DependencyManager;
use crate::error::HostResult;
use crate::events::{EventBus, UpdateEvent};
use enclave_types::PluginId;
use semver::Version;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// A newer published version of a library some plugin uses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableUpdate {
    pub plugin_id: PluginId,
    pub name: String,
    pub current: String,
    pub latest: String,
}

pub struct UpdateChecker {
    dependencies: Arc<DependencyManager>,
    events: EventBus<UpdateEvent>,
}

impl UpdateChecker {
    pub fn new(dependencies: Arc<DependencyManager>) -> Self {
        Self {
            dependencies,
            events: EventBus::new(),
        }
    }

    pub fn events(&self) -> &EventBus<UpdateEvent> {
        &self.events
    }

    /// Queries the registry for every loaded npm library. Packages whose
    /// metadata cannot be fetched emit `update:error` and are skipped.
    pub async fn check_for_updates(&self) -> Vec<AvailableUpdate> {
        let registry = self.dependencies.loader().registry().clone();
        let mut updates = Vec::new();

        for (plugin_id, resolution) in self.dependencies.npm_resolutions() {
            let meta = match registry.refresh(&resolution.name).await {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(name = %resolution.name, error = %e, "update check failed");
                    self.events.emit(UpdateEvent::Error {
                        name: resolution.name.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            let Some(latest) = meta.latest() else {
                continue;
            };
            let newer = Version::parse(&resolution.version).is_ok_and(|current| *latest > current);
            if !newer {
                continue;
            }

            debug!(
                plugin_id = %plugin_id,
                name = %resolution.name,
                current = %resolution.version,
                %latest,
                "update available"
            );
            self.events.emit(UpdateEvent::Available {
                name: resolution.name.clone(),
                current: resolution.version.clone(),
                latest: latest.to_string(),
            });
            updates.push(AvailableUpdate {
                plugin_id,
                name: resolution.name,
                current: resolution.version,
                latest: latest.to_string(),
            });
        }
        updates
    }

    /// Loads the newer version into the plugin's sandbox and unloads the old one.
    pub async fn apply_update(&self, update: &AvailableUpdate) -> HostResult<()> {
        let result = self
            .dependencies
            .upgrade(&update.plugin_id, &update.name, &update.latest)
            .await;
        match result {
            Ok((old, new)) => {
                self.events.emit(UpdateEvent::Downloaded {
                    name: new.name.clone(),
                    version: new.version.clone(),
                });
                info!(
                    plugin_id = %update.plugin_id,
                    name = %new.name,
                    from = %old.version,
                    to = %new.version,
                    "library updated"
                );
                self.events.emit(UpdateEvent::Applied {
                    name: new.name,
                    from: old.version,
                    to: new.version,
                });
                Ok(())
            }
            Err(e) => {
                warn!(
                    plugin_id = %update.plugin_id,
                    name = %update.name,
                    error = %e,
                    "library update failed"
                );
                self.events.emit(UpdateEvent::Error {
                    name: update.name.clone(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Runs [`Self::check_for_updates`] every `period`, starting one
    /// period from now.
    pub fn start(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let found = self.check_for_updates().await;
                debug!(count = found.len(), "update check finished");
            }
        })
    }
}
