use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use recall_core::ids::ConversationId;

/// Serializes runs against the same conversation. Runs queue in arrival order
/// (tokio's mutex is fair); entries are dropped once nobody holds or waits.
#[derive(Default)]
pub struct ConversationLocks {
    inner: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &ConversationId) -> ConversationLease {
        let mutex = Arc::clone(self.inner.entry(id.clone()).or_default().value());
        let guard = mutex.lock_owned().await;
        ConversationLease {
            id: id.clone(),
            guard: Some(guard),
            map: Arc::clone(&self.inner),
        }
    }

    /// Conversations with a run in flight or queued.
    pub fn active(&self) -> usize {
        self.inner.len()
    }
}

/// Exclusive hold on one conversation for the duration of a run.
pub struct ConversationLease {
    id: ConversationId,
    guard: Option<OwnedMutexGuard<()>>,
    map: Arc<DashMap<ConversationId, Arc<Mutex<()>>>>,
}

impl Drop for ConversationLease {
    fn drop(&mut self) {
        self.guard.take();
        self.map
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
