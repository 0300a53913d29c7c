use alloy::primitives::{Address, B256, Bytes, U256};
use async_trait::async_trait;

use crate::{decoder::abi, error::SourceError, types::LogRecord};

pub mod endpoints;
pub mod rpc;

pub use endpoints::{EndpointRotation, sanitize_endpoint};
pub use rpc::RpcLogSource;

/// `eth_getLogs` parameters: any of `addresses` emitting any of `topics` as topic0.
///
/// A non-empty `token_ids` further restricts position-manager logs to those
/// tokens, through whichever topic slot each signature indexes the id in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
    pub token_ids: Vec<U256>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogFilter {
    /// Whether `log` would be returned by a node honouring this filter.
    pub fn matches(&self, log: &LogRecord) -> bool {
        if log.block_number < self.from_block || log.block_number > self.to_block {
            return false;
        }
        if !self.addresses.is_empty() && !self.addresses.contains(&log.address) {
            return false;
        }
        let Some(topic0) = log.topics.first() else {
            return false;
        };
        if !self.topics.is_empty() && !self.topics.contains(topic0) {
            return false;
        }
        if self.token_ids.is_empty() {
            return true;
        }
        abi::token_id_topic(topic0)
            .and_then(|slot| log.topics.get(slot))
            .is_some_and(|word| self.token_ids.contains(&U256::from_be_bytes(word.0)))
    }
}

/// One JSON-RPC endpoint of the chain being indexed.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Endpoint label safe for logs (no path or credentials).
    fn endpoint(&self) -> &str;

    async fn head_block(&self) -> Result<u64, SourceError>;

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError>;

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError>;

    /// Read-only `eth_call` against the latest block.
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, SourceError>;
}
