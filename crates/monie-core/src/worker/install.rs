use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use url::Url;

use crate::cache::{CacheStore, GenerationId, PrecacheManifest};
use crate::http::Network;
use crate::notify::NotificationGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    Idle,
    Installing,
    Installed,
    Failed,
}

/// Populates this deployment's generation from the precache manifest.
pub struct InstallCoordinator {
    version: GenerationId,
    manifest: PrecacheManifest,
    origin: Url,
    store: CacheStore,
    network: Arc<dyn Network>,
    gateway: Arc<NotificationGateway>,
    state: RwLock<InstallState>,
}

impl InstallCoordinator {
    pub fn new(
        version: GenerationId,
        manifest: PrecacheManifest,
        origin: Url,
        store: CacheStore,
        network: Arc<dyn Network>,
        gateway: Arc<NotificationGateway>,
    ) -> Self {
        Self {
            version,
            manifest,
            origin,
            store,
            network,
            gateway,
            state: RwLock::new(InstallState::Idle),
        }
    }

    pub async fn state(&self) -> InstallState {
        *self.state.read().await
    }

    /// Install the generation. A failure is logged and leaves the previous
    /// active generation serving; it is not retried.
    pub async fn install(&self) -> InstallState {
        {
            let mut state = self.state.write().await;
            if *state == InstallState::Installing {
                warn!(generation = %self.version, "Install already in progress");
                return InstallState::Installing;
            }
            *state = InstallState::Installing;
        }

        let previous = self.store.active().await;
        if previous.as_ref() == Some(&self.version) {
            info!(generation = %self.version, "Generation already active, nothing to install");
            return self.finish(InstallState::Installed).await;
        }

        info!(generation = %self.version, resources = self.manifest.len(), "Installing");
        let handle = self.store.open(self.version.clone());
        match handle
            .add_all(&self.manifest, &self.origin, self.network.as_ref())
            .await
        {
            Ok(_) => {
                match previous {
                    Some(previous) => {
                        info!(generation = %self.version, %previous, "Update installed, waiting for activation");
                        self.gateway
                            .notify(
                                &format!("New version {} available", self.version),
                                "Close all instances of the app to apply the update",
                                "update",
                            )
                            .await;
                    }
                    None => {
                        self.gateway
                            .notify(
                                "Ready for offline use",
                                "You can use this web app at any time, even when you're offline.",
                                "installed",
                            )
                            .await;
                    }
                }
                self.finish(InstallState::Installed).await
            }
            Err(e) => {
                error!(generation = %self.version, error = %e, "Install failed");
                self.finish(InstallState::Failed).await
            }
        }
    }

    async fn finish(&self, outcome: InstallState) -> InstallState {
        *self.state.write().await = outcome;
        outcome
    }
}
