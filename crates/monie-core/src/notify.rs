//! Permission-gated user notifications.
//!
//! The worker only decides whether to notify and with what content; showing
//! the notification is the job of a `NotificationSink` supplied by the host.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::error::Result;
use crate::http::CacheKey;
use crate::worker::WorkerState;

/// Notification icon, precached with every generation
const ICON_PATH: &str = "img/icon192.png";

/// Monochrome badge, precached with every generation
const BADGE_PATH: &str = "img/icon48-mono.png";

/// Where the art for a notification comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum AssetRef {
    /// Served from the active generation, so it renders offline.
    Cached {
        url: String,
        #[serde(skip)]
        body: Vec<u8>,
    },
    /// Not cached; the sink has to load it from the network.
    Live { url: String },
}

impl AssetRef {
    pub fn url(&self) -> &str {
        match self {
            AssetRef::Cached { url, .. } | AssetRef::Live { url } => url,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, AssetRef::Cached { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub icon: AssetRef,
    pub badge: AssetRef,
    pub body: String,
    pub tag: String,
}

/// Platform side of notifications.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Whether the platform has granted notification permission.
    fn permission_granted(&self) -> bool;

    async fn show(&self, notification: Notification) -> Result<()>;
}

pub struct NotificationGateway {
    sink: Arc<dyn NotificationSink>,
    state: Arc<WorkerState>,
    store: CacheStore,
    origin: Url,
}

impl NotificationGateway {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        state: Arc<WorkerState>,
        store: CacheStore,
        origin: Url,
    ) -> Self {
        Self {
            sink,
            state,
            store,
            origin,
        }
    }

    /// Platform permission and the user's in-app preference, read now.
    pub async fn gate(&self) -> bool {
        self.sink.permission_granted() && self.state.notifications_enabled().await == Some(true)
    }

    /// Show a notification if the gate allows it. Returns whether it was shown;
    /// a closed gate or a failing sink is not an error for the caller.
    pub async fn notify(&self, title: &str, body: &str, tag: &str) -> bool {
        if !self.gate().await {
            debug!(title, tag, "Notification suppressed");
            return false;
        }

        let notification = Notification {
            title: title.to_string(),
            icon: self.resolve_asset(ICON_PATH).await,
            badge: self.resolve_asset(BADGE_PATH).await,
            body: body.to_string(),
            tag: tag.to_string(),
        };

        match self.sink.show(notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(title, error = %e, "Failed to show notification");
                false
            }
        }
    }

    async fn resolve_asset(&self, path: &str) -> AssetRef {
        let url = match self.origin.join(path) {
            Ok(url) => url,
            Err(_) => {
                return AssetRef::Live {
                    url: path.to_string(),
                }
            }
        };
        match self.store.match_active(&CacheKey::get(&url)).await {
            Some(cached) => AssetRef::Cached {
                url: url.to_string(),
                body: cached.response.body,
            },
            None => AssetRef::Live {
                url: url.to_string(),
            },
        }
    }
}
