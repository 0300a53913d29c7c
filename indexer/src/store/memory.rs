use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::Utc;

use super::{
    EventQuery, EventReader, PoolEventRecord, PositionEventRecord, TransferRecord, parse_pool,
};
use crate::{
    checkpoint::CheckpointStore,
    error::StoreError,
    types::{Checkpoint, DecodedEvent, EventId, PoolEventName, PositionInfo, hex_address},
    writer::{EventStore, UpsertOutcome},
};

type RowKey = (String, i64);

#[derive(Default)]
struct Tables {
    transfers: BTreeMap<RowKey, TransferRecord>,
    positions: BTreeMap<RowKey, PositionEventRecord>,
    pools: BTreeMap<RowKey, PoolEventRecord>,
    checkpoints: HashMap<(String, String), Checkpoint>,
    rejected: HashSet<EventId>,
}

/// In-process store with the same upsert and checkpoint semantics as Postgres.
/// Used by tests and `--memory` runs.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    available: AtomicBool,
    checkpoint_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
            checkpoint_writes: AtomicBool::new(true),
        }
    }

    /// Makes every later upsert of `id` fail as a row-level rejection.
    pub fn reject_row(&self, id: EventId) {
        self.lock().rejected.insert(id);
    }

    /// Simulates a lost connection: every call fails as unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fails checkpoint writes only, leaving event rows and reads working.
    pub fn set_checkpoint_writes_available(&self, available: bool) {
        self.checkpoint_writes.store(available, Ordering::SeqCst);
    }

    pub fn transfer_count(&self) -> usize {
        self.lock().transfers.len()
    }

    pub fn position_event_count(&self) -> usize {
        self.lock().positions.len()
    }

    pub fn pool_event_count(&self) -> usize {
        self.lock().pools.len()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }
}

fn upsert<R, F>(table: &mut BTreeMap<RowKey, R>, key: RowKey, record: R, merge: F) -> UpsertOutcome
where
    F: FnOnce(&mut R, R),
{
    match table.get_mut(&key) {
        Some(existing) => {
            merge(existing, record);
            UpsertOutcome::Updated
        }
        None => {
            table.insert(key, record);
            UpsertOutcome::Inserted
        }
    }
}

fn page<R: Clone>(rows: Vec<&R>, query: &EventQuery) -> Vec<R> {
    rows.into_iter()
        .skip(query.offset() as usize)
        .take(query.limit() as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn upsert_event(&self, event: &DecodedEvent) -> Result<UpsertOutcome, StoreError> {
        self.check_available()?;
        let mut tables = self.lock();
        if tables.rejected.contains(&event.id()) {
            return Err(StoreError::Row(format!("row {} rejected", event.id())));
        }

        let outcome = match event {
            DecodedEvent::Transfer(transfer) => {
                let record = TransferRecord::from(transfer);
                let key = (record.tx_hash.clone(), record.log_index);
                upsert(&mut tables.transfers, key, record, |existing, new| {
                    existing.block_timestamp = new.block_timestamp.or(existing.block_timestamp);
                    existing.metadata = new.metadata;
                })
            }
            DecodedEvent::Position(position) => {
                let record = PositionEventRecord::from(position);
                let key = (record.tx_hash.clone(), record.log_index);
                upsert(&mut tables.positions, key, record, |existing, new| {
                    existing.block_timestamp = new.block_timestamp.or(existing.block_timestamp);
                    existing.pool = existing.pool.take().or(new.pool);
                    existing.tick_lower = existing.tick_lower.or(new.tick_lower);
                    existing.tick_upper = existing.tick_upper.or(new.tick_upper);
                    existing.price = new.price.or(existing.price);
                    existing.usd_value = new.usd_value.or(existing.usd_value);
                    existing.metadata = new.metadata;
                })
            }
            DecodedEvent::Pool(pool) => {
                let record = PoolEventRecord::from(pool);
                let key = (record.tx_hash.clone(), record.log_index);
                upsert(&mut tables.pools, key, record, |existing, new| {
                    existing.block_timestamp = new.block_timestamp.or(existing.block_timestamp);
                    existing.price = new.price.or(existing.price);
                    existing.metadata = new.metadata;
                })
            }
        };
        Ok(outcome)
    }

    async fn unresolved_positions(&self, limit: i64) -> Result<Vec<U256>, StoreError> {
        self.check_available()?;
        let tables = self.lock();
        let token_ids: BTreeSet<U256> = tables
            .positions
            .values()
            .filter(|r| r.pool.is_none())
            .filter_map(|r| r.token_id.parse().ok())
            .collect();
        Ok(token_ids.into_iter().take(limit.max(0) as usize).collect())
    }

    async fn assign_pool(&self, token_id: U256, info: &PositionInfo) -> Result<u64, StoreError> {
        self.check_available()?;
        let token_id = token_id.to_string();
        let pool = hex_address(&info.pool);
        let mut tables = self.lock();
        let mut changed = 0;
        for record in tables.positions.values_mut() {
            if record.token_id == token_id && record.pool.is_none() {
                record.pool = Some(pool.clone());
                record.tick_lower = record.tick_lower.or(Some(info.tick_lower));
                record.tick_upper = record.tick_upper.or(Some(info.tick_upper));
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get(&self, source: &str, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .checkpoints
            .get(&(source.to_string(), key.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        source: &str,
        key: &str,
        last_block: u64,
        events_delta: u64,
    ) -> Result<Checkpoint, StoreError> {
        self.check_available()?;
        if !self.checkpoint_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("checkpoint table offline".into()));
        }
        let mut tables = self.lock();
        let checkpoint = tables
            .checkpoints
            .entry((source.to_string(), key.to_string()))
            .and_modify(|c| {
                c.last_block = c.last_block.max(last_block);
                c.events_count += events_delta;
                c.updated_at = Utc::now();
            })
            .or_insert_with(|| Checkpoint {
                source: source.to_string(),
                key: key.to_string(),
                last_block,
                events_count: events_delta,
                updated_at: Utc::now(),
            });
        Ok(checkpoint.clone())
    }

    async fn reset(&self, source: &str, key: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self
            .lock()
            .checkpoints
            .remove(&(source.to_string(), key.to_string()))
            .is_some())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        self.check_available()?;
        let mut checkpoints: Vec<Checkpoint> =
            self.lock().checkpoints.values().cloned().collect();
        checkpoints.sort_by(|a, b| (&a.source, &a.key).cmp(&(&b.source, &b.key)));
        Ok(checkpoints)
    }
}

#[async_trait]
impl EventReader for MemoryStore {
    async fn transfers(&self, query: &EventQuery) -> Result<Vec<TransferRecord>, StoreError> {
        self.check_available()?;
        let tables = self.lock();
        let mut rows: Vec<&TransferRecord> = tables
            .transfers
            .values()
            .filter(|r| query.token_id.as_ref().is_none_or(|t| &r.token_id == t))
            .filter(|r| query.contains_block(r.block_number))
            .collect();
        rows.sort_by_key(|r| (r.block_number, r.log_index));
        Ok(page(rows, query))
    }

    async fn position_events(
        &self,
        query: &EventQuery,
    ) -> Result<Vec<PositionEventRecord>, StoreError> {
        self.check_available()?;
        let pool = query.pool();
        let event_type = query.position_event_type()?.map(|t| t.as_str());
        let tables = self.lock();
        let mut rows: Vec<&PositionEventRecord> = tables
            .positions
            .values()
            .filter(|r| query.token_id.as_ref().is_none_or(|t| &r.token_id == t))
            .filter(|r| pool.as_ref().is_none_or(|p| r.pool.as_ref() == Some(p)))
            .filter(|r| event_type.is_none_or(|t| r.event_type == t))
            .filter(|r| query.contains_block(r.block_number))
            .collect();
        rows.sort_by_key(|r| (r.block_number, r.log_index));
        Ok(page(rows, query))
    }

    async fn pool_events(&self, query: &EventQuery) -> Result<Vec<PoolEventRecord>, StoreError> {
        self.check_available()?;
        let pool = query.pool();
        let event_name = query.pool_event_name()?.map(|n| n.as_str());
        let tables = self.lock();
        let mut rows: Vec<&PoolEventRecord> = tables
            .pools
            .values()
            .filter(|r| pool.as_ref().is_none_or(|p| &r.pool == p))
            .filter(|r| event_name.is_none_or(|n| r.event_name == n))
            .filter(|r| query.contains_block(r.block_number))
            .collect();
        rows.sort_by_key(|r| (r.block_number, r.log_index));
        Ok(page(rows, query))
    }

    async fn created_pools(&self) -> Result<Vec<Address>, StoreError> {
        self.check_available()?;
        let created = PoolEventName::PoolCreated.as_str();
        let tables = self.lock();
        let pools: BTreeSet<&str> = tables
            .pools
            .values()
            .filter(|r| r.event_name == created)
            .map(|r| r.pool.as_str())
            .collect();
        pools.into_iter().map(parse_pool).collect()
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, B256};

    use super::*;
    use crate::types::{EventDetail, EventMetadata, PositionEvent, PositionEventType};

    fn position(log_index: u64, timestamp: Option<u64>, pool: Option<Address>) -> DecodedEvent {
        DecodedEvent::Position(PositionEvent {
            token_id: U256::from(42u64),
            pool,
            event_type: PositionEventType::Increase,
            block_number: 10 + log_index,
            tx_hash: B256::repeat_byte(0x01),
            log_index,
            timestamp,
            tick_lower: None,
            tick_upper: None,
            liquidity_delta: Some(1_000),
            amount0: Some(U256::from(5u64)),
            amount1: None,
            price: None,
            usd_value: None,
            metadata: EventMetadata::new(EventDetail::Increase),
        })
    }

    #[tokio::test]
    async fn test_conflict_keeps_creation_fields_and_fills_mutable_ones() {
        let store = MemoryStore::new();
        store.upsert_event(&position(0, None, None)).await.unwrap();

        let mut replay = position(0, Some(1_700_000_000), Some(Address::repeat_byte(0x22)));
        if let DecodedEvent::Position(p) = &mut replay {
            p.amount0 = Some(U256::from(999u64));
        }
        let outcome = store.upsert_event(&replay).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);

        let rows = store.position_events(&EventQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount0.as_deref(), Some("5"));
        assert_eq!(rows[0].block_timestamp, Some(1_700_000_000));
        assert_eq!(
            rows[0].pool.as_deref(),
            Some("0x2222222222222222222222222222222222222222")
        );
    }

    #[tokio::test]
    async fn test_assign_pool_only_touches_unresolved_rows() {
        let store = MemoryStore::new();
        store.upsert_event(&position(0, None, None)).await.unwrap();
        store.upsert_event(&position(1, None, None)).await.unwrap();

        assert_eq!(
            store.unresolved_positions(10).await.unwrap(),
            vec![U256::from(42u64)]
        );

        let info = PositionInfo {
            pool: Address::repeat_byte(0x33),
            tick_lower: -60,
            tick_upper: 60,
        };
        assert_eq!(store.assign_pool(U256::from(42u64), &info).await.unwrap(), 2);
        assert_eq!(store.assign_pool(U256::from(42u64), &info).await.unwrap(), 0);
        assert!(store.unresolved_positions(10).await.unwrap().is_empty());

        let rows = store.position_events(&EventQuery::default()).await.unwrap();
        assert!(rows.iter().all(|r| r.tick_lower == Some(-60)));
    }

    #[tokio::test]
    async fn test_reads_are_filtered_ordered_and_paginated() {
        let store = MemoryStore::new();
        for i in (0..5).rev() {
            store.upsert_event(&position(i, None, None)).await.unwrap();
        }

        let query = EventQuery {
            from_block: Some(11),
            limit: Some(2),
            offset: Some(1),
            ..Default::default()
        };
        let rows = store.position_events(&query).await.unwrap();
        let indices: Vec<i64> = rows.iter().map(|r| r.log_index).collect();
        assert_eq!(indices, vec![2, 3]);

        let none = EventQuery {
            event_type: Some("collect".into()),
            ..Default::default()
        };
        assert!(store.position_events(&none).await.unwrap().is_empty());

        let unknown = EventQuery {
            event_type: Some("FLASH".into()),
            ..Default::default()
        };
        assert!(matches!(
            store.position_events(&unknown).await,
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_writes_fail_while_rows_succeed() {
        let store = MemoryStore::new();
        store.set_checkpoint_writes_available(false);
        store.upsert_event(&position(0, None, None)).await.unwrap();
        assert!(matches!(
            store.set("npm", "positions", 10, 1).await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.get("npm", "positions").await.unwrap(), None);

        store.set_checkpoint_writes_available(true);
        assert_eq!(store.set("npm", "positions", 10, 1).await.unwrap().last_block, 10);
    }

    #[tokio::test]
    async fn test_offline_store_is_unavailable() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("npm", "positions").await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
