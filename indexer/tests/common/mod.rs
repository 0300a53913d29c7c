use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use alloy::{
    primitives::{Address, B256, Bytes, I256, U160, U256, address, aliases::I24},
    sol_types::SolType,
};
use async_trait::async_trait;
use indexer::{
    chain::{LogFilter, LogSource},
    config::IndexerConfig,
    context::IndexerContext,
    decoder::abi::{self, LiquidityChangeData, PoolCreatedData, SwapData},
    error::SourceError,
    store::MemoryStore,
    types::LogRecord,
};

pub const NPM: Address = address!("C36442b4a4522E871399CD717aBDD847Ab11FE88");
pub const OWNER: Address = address!("2222222222222222222222222222222222222222");
pub const FACTORY: Address = address!("1F98431c8aD98523631AE4a59f267346ea31F984");
/// A position manager whose logs never decode.
pub const BROKEN: Address = address!("3333333333333333333333333333333333333333");

pub struct Chain {
    head: AtomicU64,
    logs: Mutex<Vec<LogRecord>>,
}

impl Chain {
    pub fn new(head: u64) -> Arc<Self> {
        Arc::new(Self {
            head: AtomicU64::new(head),
            logs: Mutex::new(Vec::new()),
        })
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Mints `token_id` at `block`: a Transfer from zero followed by its first deposit.
    pub fn mint(&self, block: u64, token_id: u64) {
        let tx = B256::from(U256::from(block * 1_000 + token_id));
        let token = B256::from(U256::from(token_id));
        let deposit = LiquidityChangeData::abi_encode(&LiquidityChangeData {
            liquidity: 42,
            amount0: U256::from(1u64),
            amount1: U256::from(2u64),
        });
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.push(LogRecord {
            address: NPM,
            topics: vec![abi::TRANSFER, Address::ZERO.into_word(), OWNER.into_word(), token],
            data: Bytes::new(),
            block_number: block,
            transaction_hash: tx,
            log_index: 0,
        });
        logs.push(LogRecord {
            address: NPM,
            topics: vec![abi::INCREASE_LIQUIDITY, token],
            data: Bytes::from(deposit),
            block_number: block,
            transaction_hash: tx,
            log_index: 1,
        });
    }

    fn push(&self, log: LogRecord) {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(log);
    }

    /// The factory announces `pool` at `block`.
    pub fn create_pool(&self, block: u64, pool: Address) {
        let data = PoolCreatedData::abi_encode(&PoolCreatedData {
            tickSpacing: I24::try_from(60i32).expect("tick spacing fits"),
            pool,
        });
        self.push(LogRecord {
            address: FACTORY,
            topics: vec![
                abi::POOL_CREATED,
                Address::repeat_byte(0x0a).into_word(),
                Address::repeat_byte(0x0b).into_word(),
                B256::from(U256::from(3000u64)),
            ],
            data: Bytes::from(data),
            block_number: block,
            transaction_hash: B256::from(U256::from(block * 1_000)),
            log_index: 0,
        });
    }

    /// A swap on `pool` at `block`.
    pub fn swap(&self, block: u64, pool: Address) {
        let data = SwapData::abi_encode(&SwapData {
            amount0: I256::try_from(-10i64).expect("amount fits"),
            amount1: I256::try_from(10i64).expect("amount fits"),
            sqrtPriceX96: U160::from(1u128 << 96),
            liquidity: 1_000,
            tick: I24::try_from(0i32).expect("tick fits"),
        });
        self.push(LogRecord {
            address: pool,
            topics: vec![abi::POOL_SWAP, OWNER.into_word(), OWNER.into_word()],
            data: Bytes::from(data),
            block_number: block,
            transaction_hash: B256::from(U256::from(block * 1_000 + 1)),
            log_index: 0,
        });
    }

    /// An `IncreaseLiquidity` with no payload, emitted by `BROKEN`.
    pub fn malformed(&self, block: u64) {
        self.push(LogRecord {
            address: BROKEN,
            topics: vec![abi::INCREASE_LIQUIDITY, B256::from(U256::from(1u64))],
            data: Bytes::new(),
            block_number: block,
            transaction_hash: B256::from(U256::from(block * 1_000 + 2)),
            log_index: 0,
        });
    }
}

#[async_trait]
impl LogSource for Chain {
    fn endpoint(&self) -> &str {
        "https://chain.test"
    }

    async fn head_block(&self) -> Result<u64, SourceError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_logs(&self, filter: &LogFilter) -> Result<Vec<LogRecord>, SourceError> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(logs.iter().filter(|log| filter.matches(log)).cloned().collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64, SourceError> {
        Ok(1_600_000_000 + block_number)
    }

    async fn call(&self, _to: Address, _input: Bytes) -> Result<Bytes, SourceError> {
        Err(SourceError::Rpc {
            code: -32601,
            message: "eth_call not supported".into(),
        })
    }
}

pub fn config() -> IndexerConfig {
    IndexerConfig::from_str(&format!(
        r#"
        [database]
        url = "postgres://localhost/ledger"

        [rpc]
        endpoints = ["https://chain.test"]

        [scan]
        max_window_size = 50
        confirmation_margin = 20
        window_retries = 2

        [fetch]
        max_retries = 2
        base_delay_ms = 10
        min_interval_ms = 0

        [follow]
        interval_secs = 5
        max_iterations = 2

        [guard]
        failure_threshold = 3
        reset_timeout_ms = 1000

        [[sources]]
        name = "npm"
        key = "positions"
        addresses = ["{NPM}"]
        events = ["position_manager"]
        start_block = 100

        [[sources]]
        name = "broken"
        addresses = ["{BROKEN}"]
        events = ["position_manager"]
        start_block = 100

        [[sources]]
        name = "factory"
        addresses = ["{FACTORY}"]
        events = ["factory"]
        start_block = 100

        [[sources]]
        name = "pools"
        events = ["pool"]
        start_block = 100
        discover_from = "factory"
        "#
    ))
    .expect("test configuration is valid")
}

pub fn context(chain: Arc<Chain>, store: Arc<MemoryStore>) -> IndexerContext {
    IndexerContext::new(config(), store, vec![chain as Arc<dyn LogSource>])
}
