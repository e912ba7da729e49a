use std::sync::Arc;

use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::http::{CacheKey, Network, Request, Response};
use crate::notify::NotificationGateway;

/// Tag shared by refresh notifications so a newer one replaces the older
const RATES_TAG: &str = "rates";

/// Result of one refresh attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub response: Response,
    /// True iff the fetched response was written to the cache.
    pub updated: bool,
}

enum Attempt {
    Stored(Response),
    Unstored(Response),
    BadStatus { status: u16, fallback: Response },
    Unreachable { error: String, fallback: Response },
}

/// Network-first fetch-and-store for the dynamic rates resource.
pub struct RefreshService {
    request: Request,
    key: CacheKey,
    store: CacheStore,
    network: Arc<dyn Network>,
    gateway: Arc<NotificationGateway>,
}

impl RefreshService {
    /// `url` is fetched as given (typically carrying `?refresh=true`); the
    /// result is stored under its canonical key.
    pub fn new(
        url: Url,
        store: CacheStore,
        network: Arc<dyn Network>,
        gateway: Arc<NotificationGateway>,
    ) -> Self {
        let request = Request::get(url);
        let key = CacheKey::for_request(&request);
        Self {
            request,
            key,
            store,
            network,
            gateway,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Fetch fresh rates. On failure the cached value is left alone and
    /// returned instead.
    ///
    /// Overlapping refreshes queue on the key lock, so each one fetches and
    /// writes without interleaving with another.
    pub async fn refresh(&self) -> RefreshOutcome {
        let attempt = {
            let _guard = self.store.lock_key(&self.key).await;
            self.attempt().await
        };

        match attempt {
            Attempt::Stored(response) => {
                info!(key = %self.key, "Rates updated");
                self.gateway
                    .notify("Rates updated", "Successfully requested new rates", RATES_TAG)
                    .await;
                RefreshOutcome {
                    response,
                    updated: true,
                }
            }
            Attempt::Unstored(response) => RefreshOutcome {
                response,
                updated: false,
            },
            Attempt::BadStatus { status, fallback } => {
                warn!(key = %self.key, status, "Rate refresh rejected, serving cached rates");
                self.gateway
                    .notify(
                        "Failed to update rates",
                        &format!("Rate request failed with code {}", status),
                        RATES_TAG,
                    )
                    .await;
                RefreshOutcome {
                    response: fallback,
                    updated: false,
                }
            }
            Attempt::Unreachable { error, fallback } => {
                warn!(key = %self.key, error = %error, "Rate refresh failed, serving cached rates");
                self.gateway
                    .notify(
                        "Failed to update rates",
                        &format!("Rate request failed: {}", error),
                        RATES_TAG,
                    )
                    .await;
                RefreshOutcome {
                    response: fallback,
                    updated: false,
                }
            }
        }
    }

    async fn attempt(&self) -> Attempt {
        let fetched = self.network.fetch(&self.request).await;

        match fetched {
            Ok(response) if response.ok() => {
                let Some(handle) = self.store.active_handle().await else {
                    warn!(key = %self.key, "No active generation to store rates in");
                    return Attempt::Unstored(response);
                };
                match handle.put(self.key.clone(), response.clone()).await {
                    Ok(()) => Attempt::Stored(response),
                    Err(e) => {
                        warn!(key = %self.key, error = %e, "Failed to store refreshed rates");
                        Attempt::Unstored(response)
                    }
                }
            }
            Ok(response) => {
                let status = response.status;
                let fallback = self.cached().await.unwrap_or(response);
                Attempt::BadStatus { status, fallback }
            }
            Err(e) => {
                let fallback = self.cached().await.unwrap_or_else(Response::network_error);
                Attempt::Unreachable {
                    error: e.to_string(),
                    fallback,
                }
            }
        }
    }

    async fn cached(&self) -> Option<Response> {
        let cached = self.store.match_active(&self.key).await?;
        debug!(key = %self.key, age = %cached.age_display(), "Falling back to cached rates");
        Some(cached.response)
    }
}
