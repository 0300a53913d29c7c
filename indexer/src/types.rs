use std::{collections::BTreeMap, fmt, ops::AddAssign, str::FromStr};

use alloy::{
    hex,
    primitives::{Address, B256, Bytes, I256, U256},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A raw log as returned by `eth_getLogs`, already stripped of pending-log optionality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl LogRecord {
    pub fn id(&self) -> EventId {
        EventId {
            tx_hash: self.transaction_hash,
            log_index: self.log_index,
        }
    }
}

/// Inclusive block range scanned in one fetch/decode/persist cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from: u64,
    pub to: u64,
}

impl Window {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.from, self.to)
    }
}

/// Identity of every decoded event and the sole idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub tx_hash: B256,
    pub log_index: u64,
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex_b256(&self.tx_hash), self.log_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionEventType {
    Increase,
    Decrease,
    Collect,
    Mint,
}

impl PositionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionEventType::Increase => "INCREASE",
            PositionEventType::Decrease => "DECREASE",
            PositionEventType::Collect => "COLLECT",
            PositionEventType::Mint => "MINT",
        }
    }
}

impl FromStr for PositionEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INCREASE" => Ok(PositionEventType::Increase),
            "DECREASE" => Ok(PositionEventType::Decrease),
            "COLLECT" => Ok(PositionEventType::Collect),
            "MINT" => Ok(PositionEventType::Mint),
            other => Err(format!("unknown position event type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolEventName {
    Swap,
    Mint,
    Burn,
    Collect,
    PoolCreated,
}

impl PoolEventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEventName::Swap => "SWAP",
            PoolEventName::Mint => "MINT",
            PoolEventName::Burn => "BURN",
            PoolEventName::Collect => "COLLECT",
            PoolEventName::PoolCreated => "POOL_CREATED",
        }
    }
}

impl FromStr for PoolEventName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SWAP" => Ok(PoolEventName::Swap),
            "MINT" => Ok(PoolEventName::Mint),
            "BURN" => Ok(PoolEventName::Burn),
            "COLLECT" => Ok(PoolEventName::Collect),
            "POOL_CREATED" => Ok(PoolEventName::PoolCreated),
            other => Err(format!("unknown pool event name: {other}")),
        }
    }
}

/// Kind-specific details that have no dedicated column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetail {
    Transfer { mint: bool, burn: bool },
    Increase,
    Decrease,
    Collect { recipient: Address },
    Mint { owner: Address },
    Swap { sender: Address, recipient: Address },
    PoolMint { sender: Address, owner: Address },
    PoolBurn { owner: Address },
    PoolCollect { owner: Address, recipient: Address },
    PoolCreated {
        factory: Address,
        token0: Address,
        token1: Address,
        fee: u32,
        tick_spacing: i32,
    },
}

/// Forward-compatible optional fields, limited to a few explicit scalar types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(flatten)]
    pub detail: EventDetail,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, ExtraValue>,
}

impl EventMetadata {
    pub fn new(detail: EventDetail) -> Self {
        Self {
            detail,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub token_id: U256,
    pub from: Address,
    pub to: Address,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub timestamp: Option<u64>,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionEvent {
    pub token_id: U256,
    pub pool: Option<Address>,
    pub event_type: PositionEventType,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub timestamp: Option<u64>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
    /// Signed change of the position's liquidity: negative for `DecreaseLiquidity`.
    pub liquidity_delta: Option<i128>,
    pub amount0: Option<U256>,
    pub amount1: Option<U256>,
    pub price: Option<f64>,
    pub usd_value: Option<f64>,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolEvent {
    pub pool: Address,
    pub event_name: PoolEventName,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub timestamp: Option<u64>,
    pub sender: Option<Address>,
    pub owner: Option<Address>,
    pub recipient: Option<Address>,
    pub tick_lower: Option<i32>,
    pub tick_upper: Option<i32>,
    pub tick: Option<i32>,
    pub liquidity: Option<u128>,
    pub amount: Option<u128>,
    pub amount0: Option<I256>,
    pub amount1: Option<I256>,
    pub sqrt_price_x96: Option<U256>,
    pub price: Option<f64>,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Transfer(Transfer),
    Position(PositionEvent),
    Pool(PoolEvent),
}

impl DecodedEvent {
    pub fn id(&self) -> EventId {
        let (tx_hash, log_index) = match self {
            DecodedEvent::Transfer(e) => (e.tx_hash, e.log_index),
            DecodedEvent::Position(e) => (e.tx_hash, e.log_index),
            DecodedEvent::Pool(e) => (e.tx_hash, e.log_index),
        };
        EventId { tx_hash, log_index }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            DecodedEvent::Transfer(e) => e.block_number,
            DecodedEvent::Position(e) => e.block_number,
            DecodedEvent::Pool(e) => e.block_number,
        }
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        match self {
            DecodedEvent::Transfer(e) => e.timestamp = Some(timestamp),
            DecodedEvent::Position(e) => e.timestamp = Some(timestamp),
            DecodedEvent::Pool(e) => e.timestamp = Some(timestamp),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DecodedEvent::Transfer(_) => "transfer",
            DecodedEvent::Position(_) => "position",
            DecodedEvent::Pool(_) => "pool",
        }
    }
}

/// Outcome counters of one `persist` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistStats {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl PersistStats {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl AddAssign for PersistStats {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
    }
}

/// Pool membership of a position NFT, as reported by the position manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PositionInfo {
    pub pool: Address,
    pub tick_lower: i32,
    pub tick_upper: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source: String,
    pub key: String,
    pub last_block: u64,
    pub events_count: u64,
    pub updated_at: DateTime<Utc>,
}

pub fn hex_address(address: &Address) -> String {
    format!("0x{}", hex::encode(address))
}

pub fn hex_b256(value: &B256) -> String {
    format!("0x{}", hex::encode(value))
}
