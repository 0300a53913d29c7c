use std::sync::Arc;

use alloy::primitives::U256;
use futures::future::join_all;

use crate::{
    backfill::{Backfill, BackfillReport},
    chain::LogSource,
    checkpoint::{CheckpointStore, GuardedCheckpoints},
    config::{EventFamily, IndexerConfig, SourceConfig},
    error::{BackfillError, ConfigError},
    fetcher::RateLimitedFetcher,
    follow::{FollowLoop, FollowSettings, StopHandle},
    guard::DurabilityGuard,
    pipeline::{Discovery, ScanTarget, WindowPipeline},
    planner::Planner,
    registry::PoolRegistry,
    resolver::PoolResolver,
    store::EventReader,
    writer::{EventStore, IdempotentWriter},
};

/// Shared services of one indexer process. Every worker built from it gets
/// its own fetcher and call clock; the store, guard and writer are shared.
#[derive(Clone)]
pub struct IndexerContext {
    pub config: Arc<IndexerConfig>,
    pub guard: Arc<DurabilityGuard>,
    pub events: Arc<dyn EventStore>,
    pub reader: Arc<dyn EventReader>,
    pub checkpoints: GuardedCheckpoints,
    pub writer: Arc<IdempotentWriter>,
    pub sources: Vec<Arc<dyn LogSource>>,
    pub resolver: Option<Arc<dyn PoolResolver>>,
}

impl IndexerContext {
    pub fn new<S>(config: IndexerConfig, store: Arc<S>, sources: Vec<Arc<dyn LogSource>>) -> Self
    where
        S: EventStore + CheckpointStore + EventReader + 'static,
    {
        let guard = Arc::new(DurabilityGuard::new(config.guard.settings()));
        let writer = Arc::new(IdempotentWriter::new(
            store.clone(),
            guard.clone(),
            config.writer.batch_size,
        ));
        let checkpoints = GuardedCheckpoints::new(store.clone(), guard.clone());

        Self {
            config: Arc::new(config),
            guard,
            events: store.clone(),
            reader: store,
            checkpoints,
            writer,
            sources,
            resolver: None,
        }
    }

    /// Resolves the pool of position events missing one, for pipelines built afterwards.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn PoolResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn fetcher(&self) -> RateLimitedFetcher {
        RateLimitedFetcher::new(
            self.sources.clone(),
            self.config.rpc.preferred_pattern.as_deref(),
            self.config.fetch.policy(),
        )
    }

    fn source_config(&self, source: &str) -> Result<&SourceConfig, ConfigError> {
        self.config
            .source(source)
            .ok_or_else(|| ConfigError::UnknownSource(source.to_string()))
    }

    pub fn pipeline(&self, source: &str) -> Result<Arc<WindowPipeline>, ConfigError> {
        let source_config = self.source_config(source)?;
        self.build_pipeline(source_config, ScanTarget::from(source_config))
    }

    /// Pipeline for a single position of a position-manager source.
    pub fn token_pipeline(
        &self,
        source: &str,
        token_id: U256,
    ) -> Result<Arc<WindowPipeline>, ConfigError> {
        let source_config = self.source_config(source)?;
        if !source_config.events.contains(&EventFamily::PositionManager) {
            return Err(ConfigError::Invalid(format!(
                "source {source} has no position manager events to filter by token"
            )));
        }
        let target = ScanTarget::from(source_config).for_token(token_id);
        self.build_pipeline(source_config, target)
    }

    fn build_pipeline(
        &self,
        source_config: &SourceConfig,
        target: ScanTarget,
    ) -> Result<Arc<WindowPipeline>, ConfigError> {
        let scan = &self.config.scan;
        let planner = Planner::new(scan.max_window_size, scan.confirmation_margin)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut pipeline = WindowPipeline::new(
            target,
            self.fetcher(),
            self.writer.clone(),
            self.checkpoints.clone(),
            planner,
        )
        .with_timestamps(scan.fetch_timestamps);

        if let (Some(resolver), Some(settings)) = (&self.resolver, &self.config.resolver) {
            pipeline = pipeline.with_resolver(resolver.clone(), settings.concurrency);
        }

        if let Some(upstream) = &source_config.discover_from {
            let factory = self.source_config(upstream)?;
            let registry = PoolRegistry::new(self.reader.clone(), self.guard.clone())
                .with_allowlist(source_config.allowlist.clone());
            pipeline = pipeline.with_discovery(Discovery {
                registry: Arc::new(registry),
                upstream_source: factory.name.clone(),
                upstream_key: factory.key.clone(),
            });
        }
        Ok(Arc::new(pipeline))
    }

    pub fn backfill(&self, source: &str) -> Result<Backfill, ConfigError> {
        Ok(Backfill::new(
            self.pipeline(source)?,
            self.config.scan.window_retries,
        ))
    }

    pub fn token_backfill(&self, source: &str, token_id: U256) -> Result<Backfill, ConfigError> {
        Ok(Backfill::new(
            self.token_pipeline(source, token_id)?,
            self.config.scan.window_retries,
        ))
    }

    async fn backfill_one(
        &self,
        source: &str,
        range: Option<(u64, u64)>,
    ) -> Result<BackfillReport, BackfillError> {
        let mut backfill = self.backfill(source)?;
        match range {
            Some((from, to)) => backfill.run_range(from, to).await,
            None => backfill.run().await,
        }
    }

    /// Backfills `sources` side by side and reports each one, failures included;
    /// a failing source never cancels its siblings. Factory sources that feed
    /// pool discovery run to completion before the rest start.
    pub async fn backfill_all(
        &self,
        sources: &[String],
        range: Option<(u64, u64)>,
    ) -> Vec<(String, Result<BackfillReport, BackfillError>)> {
        let feeds_discovery = |name: &String| {
            self.config
                .sources
                .iter()
                .any(|s| s.discover_from.as_ref() == Some(name))
        };
        let (upstream, rest): (Vec<&String>, Vec<&String>) =
            sources.iter().partition(|name| feeds_discovery(name));

        let mut results = Vec::with_capacity(sources.len());
        for stage in [upstream, rest] {
            let runs = stage.into_iter().map(|name| async move {
                (name.clone(), self.backfill_one(name, range).await)
            });
            results.extend(join_all(runs).await);
        }
        results
    }

    pub fn follow(&self, source: &str) -> Result<(FollowLoop, StopHandle), ConfigError> {
        Ok(FollowLoop::new(
            self.pipeline(source)?,
            FollowSettings::from(&self.config.follow),
        ))
    }

    pub fn source_names(&self) -> Vec<String> {
        self.config.sources.iter().map(|s| s.name.clone()).collect()
    }
}
