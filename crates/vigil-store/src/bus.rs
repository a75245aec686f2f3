use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::StoreResult;

/// Pending list of raw system-event payloads plus an in-process wake signal.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn push(&self, raw: &str) -> StoreResult<()>;
    /// Atomically takes the full pending list, oldest first.
    async fn drain_pending(&self) -> StoreResult<Vec<String>>;
    async fn pending_len(&self) -> StoreResult<usize>;
    /// Resolves after the next in-process push (or immediately if one was missed).
    async fn wait_for_push(&self);
    async fn ping(&self) -> StoreResult<()>;
}

/// In-memory bus for tests.
#[derive(Debug, Default)]
pub struct InMemoryEventBus {
    pending: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn push(&self, raw: &str) -> StoreResult<()> {
        self.pending.lock().await.push_back(raw.to_string());
        self.notify.notify_one();
        Ok(())
    }

    async fn drain_pending(&self) -> StoreResult<Vec<String>> {
        Ok(self.pending.lock().await.drain(..).collect())
    }

    async fn pending_len(&self) -> StoreResult<usize> {
        Ok(self.pending.lock().await.len())
    }

    async fn wait_for_push(&self) {
        self.notify.notified().await;
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
