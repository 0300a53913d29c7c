use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{
    context::IndexerContext,
    error::{ConfigError, GuardError, StoreError, WindowError},
    guard::CircuitState,
    planner::PlanReport,
    server::Reply,
    store::{EventQuery, PoolEventRecord, PositionEventRecord, TransferRecord},
    types::Checkpoint,
};

#[derive(Clone)]
pub struct HandlerState {
    pub ctx: IndexerContext,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Health {
    pub status: &'static str,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckpointStatus {
    #[serde(flatten)]
    pub checkpoint: Checkpoint,
    /// Blocks between the checkpoint and the chain head, when the head is reachable.
    pub lag_blocks: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackfillRequest {
    pub from: u64,
    pub to: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackfillAccepted {
    pub source: String,
    pub from: u64,
    pub to: u64,
}

type ApiResult<T> = Result<Reply<T>, Reply<()>>;

fn store_error(err: StoreError) -> Reply<()> {
    if let StoreError::InvalidQuery(_) = err {
        return Reply::error(StatusCode::BAD_REQUEST, err);
    }
    error!(error = %err, "store read failed");
    Reply::error(StatusCode::SERVICE_UNAVAILABLE, err)
}

fn guard_error(err: GuardError) -> Reply<()> {
    error!(error = %err, "guarded store call failed");
    Reply::error(StatusCode::SERVICE_UNAVAILABLE, err)
}

fn config_error(err: ConfigError) -> Reply<()> {
    match err {
        ConfigError::UnknownSource(_) => Reply::error(StatusCode::NOT_FOUND, err),
        _ => Reply::error(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

fn window_error(err: WindowError) -> Reply<()> {
    let code = match err {
        WindowError::Checkpoint(_) | WindowError::Discovery(_) => StatusCode::SERVICE_UNAVAILABLE,
        WindowError::Plan(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::BAD_GATEWAY,
    };
    Reply::error(code, err)
}

pub async fn get_health(State(state): State<HandlerState>) -> Reply<Health> {
    Reply::ok(Health {
        status: "online",
        circuit: state.ctx.guard.state(),
    })
}

pub async fn get_transfers(
    State(state): State<HandlerState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Vec<TransferRecord>> {
    let rows = state.ctx.reader.transfers(&query).await.map_err(store_error)?;
    Ok(Reply::ok(rows))
}

pub async fn get_position_events(
    State(state): State<HandlerState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Vec<PositionEventRecord>> {
    let rows = state
        .ctx
        .reader
        .position_events(&query)
        .await
        .map_err(store_error)?;
    Ok(Reply::ok(rows))
}

pub async fn get_pool_events(
    State(state): State<HandlerState>,
    Query(query): Query<EventQuery>,
) -> ApiResult<Vec<PoolEventRecord>> {
    let rows = state
        .ctx
        .reader
        .pool_events(&query)
        .await
        .map_err(store_error)?;
    Ok(Reply::ok(rows))
}

/// Lists every checkpoint with its lag behind the current head.
pub async fn get_checkpoints(State(state): State<HandlerState>) -> ApiResult<Vec<CheckpointStatus>> {
    let checkpoints = state.ctx.checkpoints.list().await.map_err(guard_error)?;
    let head = match state.ctx.fetcher().head_block().await {
        Ok(head) => Some(head.value),
        Err(err) => {
            error!(error = %err, "head block unavailable, reporting checkpoints without lag");
            None
        }
    };

    let statuses = checkpoints
        .into_iter()
        .map(|checkpoint| CheckpointStatus {
            lag_blocks: head.map(|head| head.saturating_sub(checkpoint.last_block)),
            checkpoint,
        })
        .collect();
    Ok(Reply::ok(statuses))
}

pub async fn reset_checkpoint(
    State(state): State<HandlerState>,
    Path((source, key)): Path<(String, String)>,
) -> ApiResult<bool> {
    let removed = state
        .ctx
        .checkpoints
        .reset(&source, &key)
        .await
        .map_err(guard_error)?;
    info!(%source, %key, removed, "checkpoint reset");
    Ok(Reply::ok(removed))
}

/// Dry run: the windows the next scan of `source` would process.
pub async fn get_plan(
    State(state): State<HandlerState>,
    Path(source): Path<String>,
) -> ApiResult<PlanReport> {
    let pipeline = state.ctx.pipeline(&source).map_err(config_error)?;
    let report = pipeline.plan(None).await.map_err(window_error)?;
    Ok(Reply::ok(report))
}

/// Starts an explicit-range backfill in the background.
pub async fn start_backfill(
    State(state): State<HandlerState>,
    Path(source): Path<String>,
    Json(request): Json<BackfillRequest>,
) -> ApiResult<BackfillAccepted> {
    if request.to < request.from {
        return Err(Reply::error(
            StatusCode::BAD_REQUEST,
            format!("range end {} is before start {}", request.to, request.from),
        ));
    }
    let mut backfill = state.ctx.backfill(&source).map_err(config_error)?;

    let task_source = source.clone();
    tokio::spawn(async move {
        match backfill.run_range(request.from, request.to).await {
            Ok(report) => info!(
                source = %task_source,
                windows = report.windows.len(),
                inserted = report.stats.inserted,
                "backfill finished"
            ),
            Err(err) => error!(source = %task_source, error = %err, "backfill failed"),
        }
    });

    Ok(Reply::accepted(BackfillAccepted {
        source,
        from: request.from,
        to: request.to,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use alloy::primitives::Address;

    use super::*;
    use crate::{
        chain::LogSource,
        config::IndexerConfig,
        store::MemoryStore,
        test_support::{FakeChain, NPM, transfer_log},
    };

    fn state(chain: Arc<FakeChain>, store: Arc<MemoryStore>) -> HandlerState {
        let config = IndexerConfig::from_str(&format!(
            r#"
            [database]
            url = "postgres://localhost/ledger"

            [rpc]
            endpoints = ["https://fake.chain"]

            [scan]
            max_window_size = 50
            confirmation_margin = 20
            fetch_timestamps = false

            [fetch]
            min_interval_ms = 0

            [[sources]]
            name = "npm"
            addresses = ["{NPM}"]
            events = ["position_manager"]
            start_block = 100
            "#
        ))
        .unwrap();
        let ctx = IndexerContext::new(config, store, vec![chain as Arc<dyn LogSource>]);
        HandlerState { ctx }
    }

    #[tokio::test]
    async fn test_plan_and_checkpoint_endpoints() {
        let chain = FakeChain::new(250, Vec::new());
        let store = Arc::new(MemoryStore::new());
        let state = state(chain, store);

        let plan = get_plan(State(state.clone()), Path("npm".into()))
            .await
            .unwrap();
        assert_eq!(plan.into_result().unwrap().windows.len(), 3);

        let missing = get_plan(State(state.clone()), Path("nope".into())).await;
        assert_eq!(missing.unwrap_err().code, StatusCode::NOT_FOUND);

        state.ctx.checkpoints.set("npm", "default", 200, 4).await.unwrap();
        let listed = get_checkpoints(State(state.clone())).await.unwrap();
        let listed = listed.into_result().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].lag_blocks, Some(50));

        let reset = reset_checkpoint(
            State(state.clone()),
            Path(("npm".into(), "default".into())),
        )
        .await
        .unwrap();
        assert_eq!(reset.into_result(), Some(true));
    }

    #[tokio::test]
    async fn test_backfill_endpoint_runs_in_background() {
        let chain = FakeChain::new(1_000, vec![transfer_log(120, 0, Address::ZERO, 1)]);
        let store = Arc::new(MemoryStore::new());
        let state = state(chain, store.clone());

        let rejected = start_backfill(
            State(state.clone()),
            Path("npm".into()),
            Json(BackfillRequest { from: 10, to: 5 }),
        )
        .await;
        assert_eq!(rejected.unwrap_err().code, StatusCode::BAD_REQUEST);

        let accepted = start_backfill(
            State(state.clone()),
            Path("npm".into()),
            Json(BackfillRequest { from: 100, to: 149 }),
        )
        .await
        .unwrap();
        assert_eq!(accepted.code, StatusCode::ACCEPTED);

        for _ in 0..100 {
            if store.transfer_count() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.transfer_count(), 1);

        let transfers = get_transfers(State(state), Query(EventQuery::default()))
            .await
            .unwrap();
        assert_eq!(transfers.into_result().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_event_type_is_a_bad_request() {
        let state = state(FakeChain::new(0, Vec::new()), Arc::new(MemoryStore::new()));
        let query = EventQuery {
            event_type: Some("FLASH".into()),
            ..Default::default()
        };

        let rejected = get_pool_events(State(state), Query(query)).await.unwrap_err();
        assert_eq!(rejected.code, StatusCode::BAD_REQUEST);
        assert!(matches!(rejected.body, crate::server::Body::Error { .. }));
    }

    #[test]
    fn test_reply_body_shape() {
        let ok = serde_json::to_value(Reply::ok(7u64).body).unwrap();
        assert_eq!(ok, serde_json::json!({"status": "ok", "result": 7}));

        let failed = serde_json::to_value(Reply::<()>::error(StatusCode::NOT_FOUND, "gone").body).unwrap();
        assert_eq!(failed, serde_json::json!({"status": "error", "error": "gone"}));
    }

    #[tokio::test]
    async fn test_health_reports_closed_circuit() {
        let state = state(FakeChain::new(0, Vec::new()), Arc::new(MemoryStore::new()));
        let health = get_health(State(state)).await;
        assert_eq!(health.into_result().unwrap().circuit, CircuitState::Closed);
    }
}
