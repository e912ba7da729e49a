use tokio::sync::RwLock;
use tracing::debug;

/// In-memory state scoped to one worker process.
///
/// Lifecycle: empty when the worker starts, filled only through client
/// messages, never written to disk. A restarted worker has forgotten
/// everything, so clients must resend their preferences after reconnecting.
#[derive(Debug, Default)]
pub struct WorkerState {
    notifications_enabled: RwLock<Option<bool>>,
}

impl WorkerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's in-app notification preference; `None` until a client
    /// has sent one.
    pub async fn notifications_enabled(&self) -> Option<bool> {
        *self.notifications_enabled.read().await
    }

    pub async fn set_notifications_enabled(&self, enabled: bool) {
        debug!(enabled, "Notification preference updated");
        *self.notifications_enabled.write().await = Some(enabled);
    }
}
