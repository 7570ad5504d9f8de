//! Process-wide mutual exclusion for prewarm sessions.
//!
//! At most one session may be active. A caller that fails to acquire is
//! dropped, never queued.

use std::sync::Arc;

use tokio::sync::watch;

/// Shared "prewarm in progress" state.
#[derive(Debug, Clone)]
pub struct PrewarmContext {
    active: Arc<watch::Sender<bool>>,
}

/// Proof that this holder owns the single session slot. Released when
/// dropped.
#[derive(Debug)]
#[must_use = "dropping the permit releases the session slot"]
pub struct SessionPermit {
    active: Arc<watch::Sender<bool>>,
}

impl Default for PrewarmContext {
    fn default() -> Self {
        Self::new()
    }
}

impl PrewarmContext {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            active: Arc::new(tx),
        }
    }

    /// Claim the session slot, or `None` if a session is already active.
    pub fn try_acquire(&self) -> Option<SessionPermit> {
        let claimed = self.active.send_if_modified(|active| {
            if *active {
                return false;
            }
            *active = true;
            true
        });
        claimed.then(|| SessionPermit {
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Resolve once no session holds the slot.
    pub async fn idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|active| !*active).await;
    }
}

impl SessionPermit {
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.active.send_replace(false);
    }
}
