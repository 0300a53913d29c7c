use std::sync::Arc;

use alloy::primitives::U256;
use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use indexer::{
    backfill::BackfillReport,
    chain::{LogSource, RpcLogSource},
    config::IndexerConfig,
    context::IndexerContext,
    follow::FollowGroup,
    resolver::{CachedPoolResolver, OnChainPoolResolver, repair_pools},
    server::Server,
    store::{MemoryStore, PgStore},
    telemetry,
};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "indexer", about = "Position ledger indexer for Uniswap V3 style contracts")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "INDEXER_CONFIG", default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Keep the ledger in process memory instead of Postgres
    #[arg(long)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan from the checkpoint (or an explicit range) up to the safe head, then exit
    Backfill {
        /// Source to backfill; all configured sources when omitted
        source: Option<String>,
        #[arg(long, requires = "to")]
        from: Option<u64>,
        #[arg(long, requires = "from")]
        to: Option<u64>,
        /// Scan only this position, checkpointed under `tokenId:<id>`; repeatable
        #[arg(long = "token-id", requires = "source")]
        token_ids: Vec<String>,
    },
    /// Keep scanning new blocks until interrupted
    Follow { source: Option<String> },
    /// Print the windows the next scan would process
    Plan { source: String },
    /// Delete a checkpoint so the next scan starts at the configured start block
    Reset {
        source: String,
        #[arg(long, default_value = "default")]
        key: String,
    },
    /// Print every checkpoint with its lag behind the head
    Status,
    /// Resolve pools for stored position events that have none
    RepairPools {
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },
    /// Serve the read API, optionally following every source in the background
    Serve {
        #[arg(long)]
        follow: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.json_logs);

    let config = IndexerConfig::from_toml(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config))?;
    info!(
        sources = config.sources.len(),
        endpoints = config.rpc.endpoints.len(),
        "configuration loaded"
    );

    let ctx = build_context(config, cli.memory).await?;

    match cli.command {
        Command::Backfill {
            source,
            from,
            to,
            token_ids,
        } => {
            let range = from.zip(to);
            if range.is_some() && source.is_none() {
                bail!("--from/--to need an explicit source");
            }
            match source {
                Some(source) if !token_ids.is_empty() => {
                    backfill_tokens(&ctx, &source, &token_ids, range).await
                }
                source => backfill(&ctx, selected(&ctx, source), range).await,
            }
        }
        Command::Follow { source } => follow(&ctx, selected(&ctx, source)).await,
        Command::Plan { source } => {
            let report = ctx.pipeline(&source)?.plan(None).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Reset { source, key } => {
            let removed = ctx.checkpoints.reset(&source, &key).await?;
            info!(%source, %key, removed, "checkpoint reset");
            Ok(())
        }
        Command::Status => status(&ctx).await,
        Command::RepairPools { limit } => {
            let Some(resolver) = ctx.resolver.as_deref() else {
                bail!("repair-pools needs a [resolver] section in the configuration");
            };
            let concurrency = ctx.config.resolver.as_ref().map_or(1, |r| r.concurrency);
            let report =
                repair_pools(ctx.events.as_ref(), &ctx.guard, resolver, concurrency, limit).await?;
            info!(
                positions = report.positions,
                resolved = report.resolved,
                rows_updated = report.rows_updated,
                "pool repair finished"
            );
            Ok(())
        }
        Command::Serve { follow: with_follow } => {
            let server = Server::new(ctx.config.server.address.clone(), ctx.clone());
            if with_follow {
                let names = ctx.source_names();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = follow(&ctx, names).await {
                        warn!(error = %err, "background follow stopped");
                    }
                });
            }
            server.run().await?;
            Ok(())
        }
    }
}

async fn build_context(config: IndexerConfig, memory: bool) -> anyhow::Result<IndexerContext> {
    let sources = config
        .rpc
        .endpoints
        .iter()
        .map(|url| RpcLogSource::new(url).map(|source| Arc::new(source) as Arc<dyn LogSource>))
        .collect::<Result<Vec<_>, _>>()?;

    let ctx = if memory {
        warn!("using in-memory store, nothing will survive a restart");
        IndexerContext::new(config, Arc::new(MemoryStore::new()), sources)
    } else {
        let store = PgStore::from_db_url(&config.database.url, config.database.max_connections)
            .await
            .context("failed to connect to database")?;
        store.create_tables().await?;
        IndexerContext::new(config, Arc::new(store), sources)
    };

    // The resolver has a fetcher, and so a call clock, of its own.
    let Some(settings) = ctx.config.resolver.clone() else {
        return Ok(ctx);
    };
    let on_chain = OnChainPoolResolver::new(
        Arc::new(ctx.fetcher()),
        settings.position_manager,
        settings.factory,
    );
    let cached = CachedPoolResolver::new(Arc::new(on_chain), settings.cache_capacity);
    Ok(ctx.with_resolver(Arc::new(cached)))
}

fn selected(ctx: &IndexerContext, source: Option<String>) -> Vec<String> {
    source.map_or_else(|| ctx.source_names(), |name| vec![name])
}

fn log_backfill(report: &BackfillReport) {
    info!(
        source = %report.source,
        key = %report.key,
        windows = report.windows.len(),
        inserted = report.stats.inserted,
        updated = report.stats.updated,
        skipped = report.stats.skipped,
        checkpoint = ?report.last_checkpoint,
        credits = report.rpc_cost.total_credits,
        usd = report.rpc_cost.usd_estimate,
        "backfill done"
    );
}

async fn backfill(
    ctx: &IndexerContext,
    sources: Vec<String>,
    range: Option<(u64, u64)>,
) -> anyhow::Result<()> {
    let mut failed = Vec::new();
    for (name, result) in ctx.backfill_all(&sources, range).await {
        match result {
            Ok(report) => log_backfill(&report),
            Err(err) => {
                error!(source = %name, error = %err, "backfill failed");
                failed.push(name);
            }
        }
    }
    if !failed.is_empty() {
        bail!("backfill failed for {}", failed.join(", "));
    }
    Ok(())
}

/// Token backfills share one endpoint budget, so they run one after another.
async fn backfill_tokens(
    ctx: &IndexerContext,
    source: &str,
    token_ids: &[String],
    range: Option<(u64, u64)>,
) -> anyhow::Result<()> {
    for raw in token_ids {
        let token_id: U256 = raw
            .parse()
            .map_err(|e| anyhow!("invalid token id {raw}: {e}"))?;
        let mut backfill = ctx.token_backfill(source, token_id)?;
        let report = match range {
            Some((from, to)) => backfill.run_range(from, to).await,
            None => backfill.run().await,
        }
        .with_context(|| format!("backfill of token {token_id} failed"))?;
        log_backfill(&report);
    }
    Ok(())
}

async fn follow(ctx: &IndexerContext, sources: Vec<String>) -> anyhow::Result<()> {
    let mut group = FollowGroup::new();
    for name in &sources {
        let (follow, stop) = ctx.follow(name)?;
        group.spawn(name.clone(), follow, stop);
    }

    let handles = group.stop_handles();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested, stopping after the current iteration");
            for handle in &handles {
                handle.stop();
            }
        }
    });

    for (name, summary) in group.join().await? {
        info!(
            source = %name,
            iterations = summary.iterations,
            windows = summary.windows,
            inserted = summary.stats.inserted,
            credits = summary.rpc_cost.total_credits,
            "follow finished"
        );
    }
    Ok(())
}

async fn status(ctx: &IndexerContext) -> anyhow::Result<()> {
    let head = ctx.fetcher().head_block().await?.value;
    for checkpoint in ctx.checkpoints.list().await? {
        info!(
            source = %checkpoint.source,
            key = %checkpoint.key,
            last_block = checkpoint.last_block,
            events = checkpoint.events_count,
            lag_blocks = head.saturating_sub(checkpoint.last_block),
            updated_at = %checkpoint.updated_at,
            "checkpoint"
        );
    }
    Ok(())
}
