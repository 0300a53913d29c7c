use std::sync::Arc;

use alloy::primitives::U256;
use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::{
    error::{GuardError, PersistError, StoreError},
    guard::DurabilityGuard,
    types::{DecodedEvent, PersistStats, PositionInfo},
};

pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Write side of the event ledger. Upserts are keyed by `(tx_hash, log_index)`
/// and only overwrite mutable fields on conflict.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn upsert_event(&self, event: &DecodedEvent) -> Result<UpsertOutcome, StoreError>;

    /// Token ids of position events still waiting for their pool.
    async fn unresolved_positions(&self, limit: i64) -> Result<Vec<U256>, StoreError>;

    /// Fills the pool and tick bounds of every unresolved event of `token_id`.
    /// Returns the number of rows changed.
    async fn assign_pool(&self, token_id: U256, info: &PositionInfo) -> Result<u64, StoreError>;
}

pub struct IdempotentWriter {
    store: Arc<dyn EventStore>,
    guard: Arc<DurabilityGuard>,
    batch_size: usize,
}

impl IdempotentWriter {
    pub fn new(store: Arc<dyn EventStore>, guard: Arc<DurabilityGuard>, batch_size: usize) -> Self {
        Self {
            store,
            guard,
            batch_size: batch_size.max(1),
        }
    }

    /// Upserts `events` batch by batch. Within a batch every upsert runs
    /// independently and all are awaited before the outcome is tallied.
    ///
    /// Row rejections are counted as `skipped`. Any systemic failure fails the
    /// whole call once its batch has settled, so callers never advance a
    /// checkpoint past events that were not stored.
    pub async fn persist(&self, events: &[DecodedEvent]) -> Result<PersistStats, PersistError> {
        let mut stats = PersistStats::default();

        for batch in events.chunks(self.batch_size) {
            let results = join_all(
                batch
                    .iter()
                    .map(|event| self.guard.run("upsert_event", self.store.upsert_event(event))),
            )
            .await;

            let mut systemic: Option<GuardError> = None;
            for (event, result) in batch.iter().zip(results) {
                match result {
                    Ok(UpsertOutcome::Inserted) => stats.inserted += 1,
                    Ok(UpsertOutcome::Updated) => stats.updated += 1,
                    Err(err) if err.is_row() => {
                        stats.skipped += 1;
                        warn!(
                            event_id = %event.id(),
                            kind = event.kind(),
                            block = event.block_number(),
                            error = %err,
                            "skipping event rejected by store"
                        );
                    }
                    Err(err) => {
                        systemic.get_or_insert(err);
                    }
                }
            }

            if let Some(source) = systemic {
                return Err(PersistError::Unavailable { stats, source });
            }
            debug!(size = batch.len(), ?stats, "batch persisted");
        }

        Ok(stats)
    }
}
