use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, B256, Bytes, U256, address},
    sol_types::SolType,
};
use async_trait::async_trait;

use crate::{
    chain::{LogFilter, LogSource},
    checkpoint::GuardedCheckpoints,
    decoder::abi::{self, LiquidityChangeData},
    error::SourceError,
    fetcher::{FetchPolicy, RateLimitedFetcher},
    guard::{DurabilityGuard, GuardSettings},
    pipeline::{ScanTarget, WindowPipeline},
    planner::Planner,
    store::MemoryStore,
    types::LogRecord,
    writer::IdempotentWriter,
};

pub const NPM: Address = address!("C36442b4a4522E871399CD717aBDD847Ab11FE88");
pub const OWNER: Address = address!("1111111111111111111111111111111111111111");

/// Scriptable chain: a fixed log set, a movable head and injectable `get_logs` failures.
pub struct FakeChain {
    head: AtomicU64,
    logs: Mutex<Vec<LogRecord>>,
    failures: AtomicU32,
    get_logs_calls: AtomicU32,
}

impl FakeChain {
    pub fn new(head: u64, logs: Vec<LogRecord>) -> Arc<Self> {
        Arc::new(Self {
            head: AtomicU64::new(head),
            logs: Mutex::new(logs),
            failures: AtomicU32::new(0),
            get_logs_calls: AtomicU32::new(0),
        })
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn push_log(&self, log: LogRecord) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(log);
    }

    /// The next `count` `get_logs` calls answer with HTTP 503.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn get_logs_calls(&self) -> u32 {
        self.get_logs_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogSource for FakeChain {
    fn endpoint(&self) -> &str {
        "https://fake.chain"
    }

    async fn head_block(&self) -> Result<u64, SourceError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError> {
        self.get_logs_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Http {
                status: 503,
                body: "service unavailable".into(),
            });
        }

        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.iter().filter(|log| filter.matches(log)).cloned().collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError> {
        Ok(1_700_000_000 + block_number * 12)
    }

    async fn call(&self, _to: Address, _input: Bytes) -> Result<Bytes, SourceError> {
        Err(SourceError::Rpc {
            code: -32601,
            message: "eth_call not supported".into(),
        })
    }
}

fn tx_hash(block_number: u64) -> B256 {
    B256::from(U256::from(block_number))
}

fn token_topic(token_id: u64) -> B256 {
    B256::from(U256::from(token_id))
}

pub fn transfer_log(block_number: u64, log_index: u64, from: Address, token_id: u64) -> LogRecord {
    LogRecord {
        address: NPM,
        topics: vec![
            abi::TRANSFER,
            from.into_word(),
            OWNER.into_word(),
            token_topic(token_id),
        ],
        data: Bytes::new(),
        block_number,
        transaction_hash: tx_hash(block_number),
        log_index,
    }
}

pub fn increase_log(block_number: u64, log_index: u64, token_id: u64) -> LogRecord {
    let data = LiquidityChangeData::abi_encode(&LiquidityChangeData {
        liquidity: 1_000,
        amount0: U256::from(10u64),
        amount1: U256::from(20u64),
    });
    LogRecord {
        address: NPM,
        topics: vec![abi::INCREASE_LIQUIDITY, token_topic(token_id)],
        data: Bytes::from(data),
        block_number,
        transaction_hash: tx_hash(block_number),
        log_index,
    }
}

pub fn target(start_block: u64) -> ScanTarget {
    ScanTarget {
        source: "npm".into(),
        key: "positions".into(),
        addresses: vec![NPM],
        topics: abi::POSITION_MANAGER_TOPICS.to_vec(),
        token_ids: Vec::new(),
        start_block,
    }
}

pub fn fast_policy() -> FetchPolicy {
    FetchPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(100),
        min_interval: Duration::ZERO,
    }
}

/// Pipeline over `chain` and `store` with window size 50 and margin 20.
pub fn pipeline(
    chain: Arc<FakeChain>,
    store: Arc<MemoryStore>,
    start_block: u64,
) -> Arc<WindowPipeline> {
    pipeline_for(chain, store, target(start_block))
}

pub fn pipeline_for(
    chain: Arc<FakeChain>,
    store: Arc<MemoryStore>,
    target: ScanTarget,
) -> Arc<WindowPipeline> {
    let guard = Arc::new(DurabilityGuard::new(GuardSettings::default()));
    let fetcher = RateLimitedFetcher::new(vec![chain as Arc<dyn LogSource>], None, fast_policy());
    let writer = Arc::new(IdempotentWriter::new(store.clone(), guard.clone(), 50));
    let checkpoints = GuardedCheckpoints::new(store, guard);
    let planner = Planner::new(50, 20).unwrap();
    Arc::new(WindowPipeline::new(
        target,
        fetcher,
        writer,
        checkpoints,
        planner,
    ))
}
