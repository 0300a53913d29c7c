use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use alloy::primitives::{Address, B256, U256};
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    chain::LogFilter,
    checkpoint::GuardedCheckpoints,
    config::SourceConfig,
    decoder::{self, abi},
    error::WindowError,
    fetcher::{Fetched, RateLimitedFetcher},
    planner::{PlanReport, PlanRequest, Planner},
    registry::PoolRegistry,
    resolver::{PoolResolver, resolve_pools},
    types::{DecodedEvent, PersistStats, Window},
    writer::IdempotentWriter,
};

/// Contracts and signatures scanned under one `(source, key)` checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTarget {
    pub source: String,
    pub key: String,
    pub addresses: Vec<Address>,
    pub topics: Vec<B256>,
    /// Restricts position-manager logs to these tokens; empty scans every token.
    pub token_ids: Vec<U256>,
    pub start_block: u64,
}

impl ScanTarget {
    /// The same contracts narrowed to one position, checkpointed under `tokenId:<id>`.
    pub fn for_token(&self, token_id: U256) -> Self {
        Self {
            source: self.source.clone(),
            key: format!("tokenId:{token_id}"),
            addresses: self.addresses.clone(),
            topics: self
                .topics
                .iter()
                .copied()
                .filter(|topic| abi::token_id_topic(topic).is_some())
                .collect(),
            token_ids: vec![token_id],
            start_block: self.start_block,
        }
    }
}

impl From<&SourceConfig> for ScanTarget {
    fn from(config: &SourceConfig) -> Self {
        Self {
            source: config.name.clone(),
            key: config.key.clone(),
            addresses: config.addresses.clone(),
            topics: config.topics(),
            token_ids: Vec::new(),
            start_block: config.start_block,
        }
    }
}

/// Pool addresses learned from a factory source's stored `PoolCreated` events.
///
/// Scans never run past the factory source's checkpoint, so every pool created
/// inside a window is already in the registry when the window is fetched.
pub struct Discovery {
    pub registry: Arc<PoolRegistry>,
    pub upstream_source: String,
    pub upstream_key: String,
}

/// When a completed window moves the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Always advance to the window end.
    Advance,
    /// Advance only if the window starts at or before the block after the
    /// checkpoint, so an explicit range never hides an unscanned gap.
    Contiguous,
}

/// Stage a window is in, reported to observers of `run_window_observed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStage {
    Scanning,
    Persisting,
    Checkpointing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub window: Window,
    pub logs: usize,
    pub decoded: usize,
    pub stats: PersistStats,
    /// Fetch attempts spent on `eth_getLogs`.
    pub attempts: u32,
    /// Checkpoint after the window, `None` when it was left untouched.
    pub checkpoint: Option<u64>,
}

/// Fetch, decode, enrich, persist and checkpoint, one window at a time.
/// Both the backfill orchestrator and the follow loop drive this.
pub struct WindowPipeline {
    target: ScanTarget,
    fetcher: RateLimitedFetcher,
    writer: Arc<IdempotentWriter>,
    checkpoints: GuardedCheckpoints,
    planner: Planner,
    resolver: Option<Arc<dyn PoolResolver>>,
    resolver_concurrency: usize,
    fetch_timestamps: bool,
    discovery: Option<Discovery>,
}

impl WindowPipeline {
    pub fn new(
        target: ScanTarget,
        fetcher: RateLimitedFetcher,
        writer: Arc<IdempotentWriter>,
        checkpoints: GuardedCheckpoints,
        planner: Planner,
    ) -> Self {
        Self {
            target,
            fetcher,
            writer,
            checkpoints,
            planner,
            resolver: None,
            resolver_concurrency: 1,
            fetch_timestamps: false,
            discovery: None,
        }
    }

    #[must_use]
    pub fn with_discovery(mut self, discovery: Discovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn PoolResolver>, concurrency: usize) -> Self {
        self.resolver = Some(resolver);
        self.resolver_concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn with_timestamps(mut self, fetch_timestamps: bool) -> Self {
        self.fetch_timestamps = fetch_timestamps;
        self
    }

    pub fn target(&self) -> &ScanTarget {
        &self.target
    }

    pub fn fetcher(&self) -> &RateLimitedFetcher {
        &self.fetcher
    }

    pub async fn checkpoint_block(&self) -> Result<Option<u64>, WindowError> {
        let checkpoint = self
            .checkpoints
            .get(&self.target.source, &self.target.key)
            .await?;
        Ok(checkpoint.map(|c| c.last_block))
    }

    pub async fn head(&self) -> Result<u64, WindowError> {
        Ok(self.fetcher.head_block().await?.value)
    }

    /// Plans from the live checkpoint (or start block) up to the safe head,
    /// optionally capped at `target_end` and, for discovered pools, at the
    /// factory source's checkpoint.
    pub async fn plan(&self, target_end: Option<u64>) -> Result<PlanReport, WindowError> {
        let checkpoint_block = self.checkpoint_block().await?;
        let head_block = self.head().await?;
        let target_end = match self.discovery_horizon().await? {
            Some(horizon) => Some(target_end.map_or(horizon, |end| end.min(horizon))),
            None => target_end,
        };
        Ok(self.planner.plan(&PlanRequest {
            checkpoint_block,
            head_block,
            start_block: self.target.start_block,
            target_end,
        }))
    }

    /// Last block the factory source has durably scanned; 0 while it is cold,
    /// which leaves nothing to plan.
    async fn discovery_horizon(&self) -> Result<Option<u64>, WindowError> {
        let Some(discovery) = &self.discovery else {
            return Ok(None);
        };
        let upstream = self
            .checkpoints
            .get(&discovery.upstream_source, &discovery.upstream_key)
            .await?;
        Ok(Some(upstream.map_or(0, |c| c.last_block)))
    }

    /// Static addresses plus every discovered pool.
    async fn addresses(&self) -> Result<Vec<Address>, WindowError> {
        let mut addresses = self.target.addresses.clone();
        if let Some(discovery) = &self.discovery {
            let pools = discovery
                .registry
                .pools()
                .await
                .map_err(WindowError::Discovery)?;
            for pool in pools {
                if !addresses.contains(&pool) {
                    addresses.push(pool);
                }
            }
        }
        Ok(addresses)
    }

    /// Plans an explicit `[from, to]` range regardless of the checkpoint.
    pub async fn plan_range(&self, from: u64, to: u64) -> Result<PlanReport, WindowError> {
        let head_block = self.head().await?;
        Ok(self.planner.plan_range(from, to, head_block)?)
    }

    pub async fn run_window(
        &self,
        window: Window,
        policy: CheckpointPolicy,
    ) -> Result<WindowReport, WindowError> {
        self.run_window_observed(window, policy, |_| {}).await
    }

    /// Runs one window end to end. The checkpoint is only touched after every
    /// event of the window has been persisted or skipped as a bad row.
    pub async fn run_window_observed<F>(
        &self,
        window: Window,
        policy: CheckpointPolicy,
        mut observe: F,
    ) -> Result<WindowReport, WindowError>
    where
        F: FnMut(WindowStage) + Send,
    {
        observe(WindowStage::Scanning);
        let addresses = self.addresses().await?;
        let fetched = if addresses.is_empty() {
            // A node treats an empty address list as "any contract".
            debug!(source = %self.target.source, %window, "no pools discovered yet");
            Fetched {
                value: Vec::new(),
                attempts: 0,
            }
        } else {
            let filter = LogFilter {
                addresses,
                topics: self.target.topics.clone(),
                token_ids: self.target.token_ids.clone(),
                from_block: window.from,
                to_block: window.to,
            };
            self.fetcher.fetch_logs(&filter).await?
        };
        let logs = fetched.value;

        let mut events = decoder::decode_batch(&logs)?;
        if self.fetch_timestamps {
            self.attach_timestamps(&mut events).await?;
        }
        if let Some(resolver) = &self.resolver {
            self.attach_pools(resolver.as_ref(), &mut events).await;
        }

        observe(WindowStage::Persisting);
        let stats = self.writer.persist(&events).await?;

        observe(WindowStage::Checkpointing);
        let checkpoint = match policy {
            CheckpointPolicy::Advance => Some(self.advance(window, stats).await?),
            CheckpointPolicy::Contiguous => {
                let contiguous = match self.checkpoint_block().await? {
                    Some(last_block) => window.from <= last_block.saturating_add(1),
                    None => window.from <= self.target.start_block,
                };
                if contiguous {
                    Some(self.advance(window, stats).await?)
                } else {
                    debug!(
                        source = %self.target.source,
                        key = %self.target.key,
                        %window,
                        "window not contiguous with checkpoint, leaving it in place"
                    );
                    None
                }
            }
        };

        Ok(WindowReport {
            window,
            logs: logs.len(),
            decoded: events.len(),
            stats,
            attempts: fetched.attempts,
            checkpoint,
        })
    }

    async fn advance(&self, window: Window, stats: PersistStats) -> Result<u64, WindowError> {
        let checkpoint = self
            .checkpoints
            .set(
                &self.target.source,
                &self.target.key,
                window.to,
                stats.inserted,
            )
            .await?;
        Ok(checkpoint.last_block)
    }

    async fn attach_timestamps(&self, events: &mut [DecodedEvent]) -> Result<(), WindowError> {
        let blocks: BTreeSet<u64> = events.iter().map(DecodedEvent::block_number).collect();
        let mut timestamps = HashMap::with_capacity(blocks.len());
        for block_number in blocks {
            let fetched = self.fetcher.block_timestamp(block_number).await?;
            timestamps.insert(block_number, fetched.value);
        }
        for event in events.iter_mut() {
            if let Some(timestamp) = timestamps.get(&event.block_number()) {
                event.set_timestamp(*timestamp);
            }
        }
        Ok(())
    }

    async fn attach_pools(&self, resolver: &dyn PoolResolver, events: &mut [DecodedEvent]) {
        let pending: BTreeSet<_> = events
            .iter()
            .filter_map(|event| match event {
                DecodedEvent::Position(position) if position.pool.is_none() => {
                    Some(position.token_id)
                }
                _ => None,
            })
            .collect();
        if pending.is_empty() {
            return;
        }

        let requested = pending.len();
        let resolved = resolve_pools(resolver, pending, self.resolver_concurrency).await;
        if resolved.len() < requested {
            warn!(
                source = %self.target.source,
                unresolved = requested - resolved.len(),
                "positions stored without pool"
            );
        }

        for event in events.iter_mut() {
            if let DecodedEvent::Position(position) = event {
                if position.pool.is_some() {
                    continue;
                }
                if let Some(info) = resolved.get(&position.token_id) {
                    position.pool = Some(info.pool);
                    position.tick_lower = position.tick_lower.or(Some(info.tick_lower));
                    position.tick_upper = position.tick_upper.or(Some(info.tick_upper));
                }
            }
        }
    }
}
