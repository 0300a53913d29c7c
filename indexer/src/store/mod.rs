use alloy::primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::StoreError,
    types::{
        EventMetadata, PoolEvent, PoolEventName, PositionEvent, PositionEventType, Transfer,
        hex_address, hex_b256,
    },
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 1000;

/// Stored form of a `Transfer`. Addresses and hashes are lowercase hex,
/// 256-bit integers decimal strings.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct TransferRecord {
    pub tx_hash: String,
    pub log_index: i64,
    pub token_id: String,
    pub from_address: String,
    pub to_address: String,
    pub block_number: i64,
    pub block_timestamp: Option<i64>,
    #[sqlx(json)]
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PositionEventRecord {
    pub tx_hash: String,
    pub log_index: i64,
    pub token_id: String,
    pub pool: Option<String>,
    pub event_type: String,
    pub block_number: i64,
    pub block_timestamp: Option<i64>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
    pub liquidity_delta: Option<String>,
    pub amount0: Option<String>,
    pub amount1: Option<String>,
    pub price: Option<f64>,
    pub usd_value: Option<f64>,
    #[sqlx(json)]
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct PoolEventRecord {
    pub tx_hash: String,
    pub log_index: i64,
    pub pool: String,
    pub event_name: String,
    pub block_number: i64,
    pub block_timestamp: Option<i64>,
    pub sender: Option<String>,
    pub owner: Option<String>,
    pub recipient: Option<String>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
    pub tick: Option<i32>,
    pub liquidity: Option<String>,
    pub amount: Option<String>,
    pub amount0: Option<String>,
    pub amount1: Option<String>,
    pub sqrt_price_x96: Option<String>,
    pub price: Option<f64>,
    #[sqlx(json)]
    pub metadata: EventMetadata,
}

fn opt_string<T: ToString>(value: Option<T>) -> Option<String> {
    value.map(|v| v.to_string())
}

impl From<&Transfer> for TransferRecord {
    fn from(event: &Transfer) -> Self {
        Self {
            tx_hash: hex_b256(&event.tx_hash),
            log_index: event.log_index as i64,
            token_id: event.token_id.to_string(),
            from_address: hex_address(&event.from),
            to_address: hex_address(&event.to),
            block_number: event.block_number as i64,
            block_timestamp: event.timestamp.map(|t| t as i64),
            metadata: event.metadata.clone(),
        }
    }
}

impl From<&PositionEvent> for PositionEventRecord {
    fn from(event: &PositionEvent) -> Self {
        Self {
            tx_hash: hex_b256(&event.tx_hash),
            log_index: event.log_index as i64,
            token_id: event.token_id.to_string(),
            pool: event.pool.as_ref().map(hex_address),
            event_type: event.event_type.as_str().to_string(),
            block_number: event.block_number as i64,
            block_timestamp: event.timestamp.map(|t| t as i64),
            tick_lower: event.tick_lower,
            tick_upper: event.tick_upper,
            liquidity_delta: opt_string(event.liquidity_delta),
            amount0: opt_string(event.amount0),
            amount1: opt_string(event.amount1),
            price: event.price,
            usd_value: event.usd_value,
            metadata: event.metadata.clone(),
        }
    }
}

impl From<&PoolEvent> for PoolEventRecord {
    fn from(event: &PoolEvent) -> Self {
        Self {
            tx_hash: hex_b256(&event.tx_hash),
            log_index: event.log_index as i64,
            pool: hex_address(&event.pool),
            event_name: event.event_name.as_str().to_string(),
            block_number: event.block_number as i64,
            block_timestamp: event.timestamp.map(|t| t as i64),
            sender: event.sender.as_ref().map(hex_address),
            owner: event.owner.as_ref().map(hex_address),
            recipient: event.recipient.as_ref().map(hex_address),
            tick_lower: event.tick_lower,
            tick_upper: event.tick_upper,
            tick: event.tick,
            liquidity: opt_string(event.liquidity),
            amount: opt_string(event.amount),
            amount0: opt_string(event.amount0),
            amount1: opt_string(event.amount1),
            sqrt_price_x96: opt_string(event.sqrt_price_x96),
            price: event.price,
            metadata: event.metadata.clone(),
        }
    }
}

/// Read-side filter shared by the HTTP API and both backends. Filters that
/// do not apply to a table are ignored for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct EventQuery {
    pub token_id: Option<String>,
    pub pool: Option<String>,
    pub event_type: Option<String>,
    pub from_block: Option<i64>,
    pub to_block: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl EventQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn pool(&self) -> Option<String> {
        self.pool.as_ref().map(|p| p.to_lowercase())
    }

    /// `event_type` read as a position event type; unknown names are rejected.
    pub fn position_event_type(&self) -> Result<Option<PositionEventType>, StoreError> {
        self.event_type
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(StoreError::InvalidQuery)
    }

    /// `event_type` read as a pool event name; unknown names are rejected.
    pub fn pool_event_name(&self) -> Result<Option<PoolEventName>, StoreError> {
        self.event_type
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(StoreError::InvalidQuery)
    }

    pub fn contains_block(&self, block_number: i64) -> bool {
        self.from_block.is_none_or(|from| block_number >= from)
            && self.to_block.is_none_or(|to| block_number <= to)
    }
}

/// Paginated reads over the persisted ledger, ordered by `(block_number, log_index)`.
#[async_trait]
pub trait EventReader: Send + Sync {
    async fn transfers(&self, query: &EventQuery) -> Result<Vec<TransferRecord>, StoreError>;

    async fn position_events(
        &self,
        query: &EventQuery,
    ) -> Result<Vec<PositionEventRecord>, StoreError>;

    async fn pool_events(&self, query: &EventQuery) -> Result<Vec<PoolEventRecord>, StoreError>;

    /// Distinct pools announced by stored `PoolCreated` events, in address order.
    async fn created_pools(&self) -> Result<Vec<Address>, StoreError>;
}

fn parse_pool(pool: &str) -> Result<Address, StoreError> {
    pool.parse()
        .map_err(|e| StoreError::Row(format!("stored pool {pool} is not an address: {e}")))
}
