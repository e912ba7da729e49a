use std::sync::Arc;

use tokio::sync::watch;

/// Counts lifecycle work still in flight.
///
/// Every dispatched event holds a `KeepAliveGuard` until its handler settles.
/// The host must not tear the worker down before `settled()` resolves, or a
/// cache write could be cut off halfway.
#[derive(Clone)]
pub struct KeepAlive {
    pending: Arc<watch::Sender<usize>>,
}

impl KeepAlive {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            pending: Arc::new(tx),
        }
    }

    pub fn hold(&self) -> KeepAliveGuard {
        self.pending.send_modify(|n| *n += 1);
        KeepAliveGuard {
            pending: Arc::clone(&self.pending),
        }
    }

    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolves once no guard is outstanding.
    pub async fn settled(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KeepAliveGuard {
    pending: Arc<watch::Sender<usize>>,
}

impl Drop for KeepAliveGuard {
    fn drop(&mut self) {
        self.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}
