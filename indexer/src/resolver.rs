use std::{collections::HashMap, sync::Arc};

use alloy::{
    primitives::{Address, Bytes, U256},
    sol,
    sol_types::SolCall,
};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use moka::future::Cache;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{
    error::{GuardError, ResolveError},
    fetcher::RateLimitedFetcher,
    guard::DurabilityGuard,
    types::PositionInfo,
    writer::EventStore,
};

sol! {
    interface INonfungiblePositionManager {
        function positions(uint256 tokenId) external view returns (
            uint96 nonce,
            address operator,
            address token0,
            address token1,
            uint24 fee,
            int24 tickLower,
            int24 tickUpper,
            uint128 liquidity,
            uint256 feeGrowthInside0LastX128,
            uint256 feeGrowthInside1LastX128,
            uint128 tokensOwed0,
            uint128 tokensOwed1
        );
    }

    interface IUniswapV3Factory {
        function getPool(address tokenA, address tokenB, uint24 fee) external view returns (address pool);
    }
}

/// Maps a position NFT to the pool it provides liquidity to.
#[async_trait]
pub trait PoolResolver: Send + Sync {
    /// `Ok(None)` when the position manager knows the token but no pool exists
    /// for its pair and fee tier.
    async fn resolve_pool_for_position(
        &self,
        token_id: U256,
    ) -> Result<Option<PositionInfo>, ResolveError>;
}

/// Resolves pools with `positions(tokenId)` followed by `getPool(token0, token1, fee)`.
///
/// Calls go through the fetcher, so they share its pacing, retries and cost meter.
pub struct OnChainPoolResolver {
    fetcher: Arc<RateLimitedFetcher>,
    position_manager: Address,
    factory: Address,
}

impl OnChainPoolResolver {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, position_manager: Address, factory: Address) -> Self {
        Self {
            fetcher,
            position_manager,
            factory,
        }
    }

    async fn call<C: SolCall>(&self, to: Address, call: C) -> Result<C::Return, ResolveError> {
        let fetched = self
            .fetcher
            .eth_call(to, Bytes::from(call.abi_encode()))
            .await?;
        C::abi_decode_returns(&fetched.value)
            .map_err(|e| ResolveError::Call(format!("{}: {e}", C::SIGNATURE)))
    }
}

#[async_trait]
impl PoolResolver for OnChainPoolResolver {
    async fn resolve_pool_for_position(
        &self,
        token_id: U256,
    ) -> Result<Option<PositionInfo>, ResolveError> {
        let position = self
            .call(
                self.position_manager,
                INonfungiblePositionManager::positionsCall { tokenId: token_id },
            )
            .await?;

        if position.token0 == Address::ZERO && position.token1 == Address::ZERO {
            return Err(ResolveError::UnknownPosition(token_id.to_string()));
        }

        let pool = self
            .call(
                self.factory,
                IUniswapV3Factory::getPoolCall {
                    tokenA: position.token0,
                    tokenB: position.token1,
                    fee: position.fee,
                },
            )
            .await?;

        if pool == Address::ZERO {
            return Ok(None);
        }

        let tick_lower = i32::try_from(position.tickLower)
            .map_err(|e| ResolveError::Call(format!("tickLower: {e}")))?;
        let tick_upper = i32::try_from(position.tickUpper)
            .map_err(|e| ResolveError::Call(format!("tickUpper: {e}")))?;

        Ok(Some(PositionInfo {
            pool,
            tick_lower,
            tick_upper,
        }))
    }
}

/// Memoizes successful resolutions; a position never changes pools.
pub struct CachedPoolResolver {
    inner: Arc<dyn PoolResolver>,
    cache: Cache<U256, PositionInfo>,
}

impl CachedPoolResolver {
    pub fn new(inner: Arc<dyn PoolResolver>, capacity: u64) -> Self {
        Self {
            inner,
            cache: Cache::new(capacity),
        }
    }
}

#[async_trait]
impl PoolResolver for CachedPoolResolver {
    async fn resolve_pool_for_position(
        &self,
        token_id: U256,
    ) -> Result<Option<PositionInfo>, ResolveError> {
        if let Some(info) = self.cache.get(&token_id).await {
            return Ok(Some(info));
        }
        let resolved = self.inner.resolve_pool_for_position(token_id).await?;
        if let Some(info) = resolved {
            self.cache.insert(token_id, info).await;
        }
        Ok(resolved)
    }
}

/// Resolves many positions with at most `concurrency` lookups in flight.
/// Unresolvable positions are logged and left out of the result.
pub async fn resolve_pools(
    resolver: &dyn PoolResolver,
    token_ids: impl IntoIterator<Item = U256>,
    concurrency: usize,
) -> HashMap<U256, PositionInfo> {
    stream::iter(token_ids)
        .map(|token_id| async move {
            (
                token_id,
                resolver.resolve_pool_for_position(token_id).await,
            )
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|(token_id, result)| async move {
            match result {
                Ok(Some(info)) => Some((token_id, info)),
                Ok(None) => {
                    debug!(%token_id, "no pool for position");
                    None
                }
                Err(err) => {
                    warn!(%token_id, error = %err, "failed to resolve pool for position");
                    None
                }
            }
        })
        .collect()
        .await
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub positions: usize,
    pub resolved: usize,
    pub rows_updated: u64,
}

/// Backfills the pool of stored position events that were persisted before
/// their pool could be resolved.
pub async fn repair_pools(
    store: &dyn EventStore,
    guard: &DurabilityGuard,
    resolver: &dyn PoolResolver,
    concurrency: usize,
    limit: i64,
) -> Result<RepairReport, GuardError> {
    let token_ids = guard
        .run("unresolved_positions", store.unresolved_positions(limit))
        .await?;
    let mut report = RepairReport {
        positions: token_ids.len(),
        ..RepairReport::default()
    };

    let resolved = resolve_pools(resolver, token_ids, concurrency).await;
    report.resolved = resolved.len();

    for (token_id, info) in &resolved {
        match guard
            .run("assign_pool", store.assign_pool(*token_id, info))
            .await
        {
            Ok(rows) => report.rows_updated += rows,
            Err(err) if err.is_row() => {
                warn!(%token_id, error = %err, "pool assignment rejected");
            }
            Err(err) => return Err(err),
        }
    }
    Ok(report)
}
