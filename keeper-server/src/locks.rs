//! Per pull request serialization.
//!
//! Passes for the same pull request run one at a time so every pass reads
//! the labels left by the one before it. Passes for different pull requests
//! run in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use keeper_core::snapshot::PullRequestId;

#[derive(Clone, Default)]
pub struct PrLocks {
    locks: Arc<Mutex<HashMap<PullRequestId, Arc<Mutex<()>>>>>,
}

impl PrLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other pass holds `id`. The lock is released when the
    /// guard drops.
    pub async fn lock(&self, id: PullRequestId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Nobody holds or waits on an entry the map alone references.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}
