use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::refresh::RefreshService;
use crate::bus::MessageBus;
use crate::models::{PushPayload, RatesDocument, WorkerMessage};
use crate::notify::NotificationGateway;

const PUSH_TAG: &str = "push";

/// What a push delivery led to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PushOutcome {
    /// Absent or undecodable payload; acknowledged without effect.
    Ignored,
    /// Rates were refreshed and sent to `delivered` clients.
    RatesBroadcast { delivered: usize, updated: bool },
    /// Rates were refreshed but the body was not valid JSON.
    RatesUnreadable,
    /// Unrecognized push type, echoed back as a notification.
    Diagnostic,
}

pub struct PushHandler {
    refresh: Arc<RefreshService>,
    bus: MessageBus,
    gateway: Arc<NotificationGateway>,
}

impl PushHandler {
    pub fn new(refresh: Arc<RefreshService>, bus: MessageBus, gateway: Arc<NotificationGateway>) -> Self {
        Self {
            refresh,
            bus,
            gateway,
        }
    }

    /// Handle one push delivery: notify, refresh, then broadcast.
    pub async fn handle_push(&self, raw: Option<&[u8]>) -> PushOutcome {
        let Some(payload) = PushPayload::decode(raw) else {
            debug!("Push payload ignored");
            return PushOutcome::Ignored;
        };

        match payload {
            PushPayload::NewRates { .. } => {
                info!("Push: new rates published");
                self.gateway
                    .notify("New Rates available", "Fetching the latest exchange rates", PUSH_TAG)
                    .await;

                let outcome = self.refresh.refresh().await;
                match RatesDocument::from_slice(&outcome.response.body) {
                    Ok(rates) => {
                        let delivered = self.bus.broadcast(WorkerMessage::NewRates(rates)).await;
                        debug!(delivered, updated = outcome.updated, "Broadcast new rates");
                        PushOutcome::RatesBroadcast {
                            delivered,
                            updated: outcome.updated,
                        }
                    }
                    Err(e) => {
                        warn!(status = outcome.response.status, error = %e, "Refreshed rates are not valid JSON");
                        PushOutcome::RatesUnreadable
                    }
                }
            }
            PushPayload::Other { kind, raw } => {
                debug!(kind = %kind, "Push with unrecognized type");
                self.gateway.notify("Push message received", &raw, PUSH_TAG).await;
                PushOutcome::Diagnostic
            }
        }
    }
}
