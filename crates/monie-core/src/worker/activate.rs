use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::bus::MessageBus;
use crate::cache::{CacheStore, GenerationId};
use crate::models::WorkerMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationState {
    Idle,
    Activating,
    Active,
}

/// When an installed update takes over from the generation in service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationPolicy {
    /// Activate as soon as install completes.
    #[default]
    Immediate,
    /// Wait until no client is connected to the running version.
    WhenClientsReleased,
}

/// Promotes the installed generation and cleans up after its predecessors.
pub struct ActivationCoordinator {
    version: GenerationId,
    store: CacheStore,
    bus: MessageBus,
    state: RwLock<ActivationState>,
}

impl ActivationCoordinator {
    pub fn new(version: GenerationId, store: CacheStore, bus: MessageBus) -> Self {
        Self {
            version,
            store,
            bus,
            state: RwLock::new(ActivationState::Idle),
        }
    }

    pub async fn state(&self) -> ActivationState {
        *self.state.read().await
    }

    /// Mark the generation active without re-running activation, for a
    /// worker restarting on top of its own already-active generation.
    /// Generations left behind by an interrupted cleanup are dropped.
    pub async fn resume(&self) -> bool {
        if self.store.active().await.as_ref() == Some(&self.version) {
            let deleted = self.collect_garbage().await;
            if deleted > 0 {
                info!(generation = %self.version, deleted, "Removed stale generations on resume");
            }
            *self.state.write().await = ActivationState::Active;
            return true;
        }
        false
    }

    /// Promote, then claim clients, drop old generations and announce the
    /// version. The three follow-up steps run concurrently and all finish
    /// before this returns.
    pub async fn activate(&self) -> ActivationState {
        *self.state.write().await = ActivationState::Activating;
        info!(generation = %self.version, "Activating");

        if let Err(e) = self.store.set_active(&self.version).await {
            error!(generation = %self.version, error = %e, "Cannot activate generation");
            *self.state.write().await = ActivationState::Idle;
            return ActivationState::Idle;
        }

        let status = WorkerMessage::StatusInfo {
            version: self.version.to_string(),
        };
        let (claimed, deleted, notified) = tokio::join!(
            self.bus.claim(&self.version),
            self.collect_garbage(),
            self.bus.broadcast(status),
        );
        info!(generation = %self.version, claimed, deleted, notified, "Activated");

        *self.state.write().await = ActivationState::Active;
        ActivationState::Active
    }

    async fn collect_garbage(&self) -> usize {
        let stale: Vec<GenerationId> = self
            .store
            .list_generations()
            .await
            .into_iter()
            .filter(|id| *id != self.version)
            .collect();

        let results = join_all(stale.iter().map(|id| self.store.delete(id))).await;
        let mut deleted = 0;
        for (id, result) in stale.iter().zip(results) {
            match result {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!(generation = %id, error = %e, "Failed to delete old generation"),
            }
        }
        deleted
    }
}
