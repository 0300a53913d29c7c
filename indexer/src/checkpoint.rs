use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    error::{GuardError, StoreError},
    guard::DurabilityGuard,
    types::Checkpoint,
};

/// Durable last-processed-block marker per `(source, key)`.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, source: &str, key: &str) -> Result<Option<Checkpoint>, StoreError>;

    /// Creates or advances a checkpoint. `last_block` never moves backwards and
    /// `events_delta` is added to the running count.
    async fn set(
        &self,
        source: &str,
        key: &str,
        last_block: u64,
        events_delta: u64,
    ) -> Result<Checkpoint, StoreError>;

    /// Deletes a checkpoint; the next scan starts from the configured start block.
    async fn reset(&self, source: &str, key: &str) -> Result<bool, StoreError>;

    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError>;
}

/// Checkpoint access routed through the durability guard.
#[derive(Clone)]
pub struct GuardedCheckpoints {
    store: Arc<dyn CheckpointStore>,
    guard: Arc<DurabilityGuard>,
}

impl GuardedCheckpoints {
    pub fn new(store: Arc<dyn CheckpointStore>, guard: Arc<DurabilityGuard>) -> Self {
        Self { store, guard }
    }

    pub async fn get(&self, source: &str, key: &str) -> Result<Option<Checkpoint>, GuardError> {
        self.guard
            .run("checkpoint_get", self.store.get(source, key))
            .await
    }

    pub async fn set(
        &self,
        source: &str,
        key: &str,
        last_block: u64,
        events_delta: u64,
    ) -> Result<Checkpoint, GuardError> {
        self.guard
            .run(
                "checkpoint_set",
                self.store.set(source, key, last_block, events_delta),
            )
            .await
    }

    pub async fn reset(&self, source: &str, key: &str) -> Result<bool, GuardError> {
        self.guard
            .run("checkpoint_reset", self.store.reset(source, key))
            .await
    }

    pub async fn list(&self) -> Result<Vec<Checkpoint>, GuardError> {
        self.guard.run("checkpoint_list", self.store.list()).await
    }
}
