pub mod handlers;

use std::fmt::Display;

use axum::{
    Json, Router,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use handlers::{
    HandlerState, get_checkpoints, get_health, get_plan, get_pool_events, get_position_events,
    get_transfers, reset_checkpoint, start_backfill,
};
use serde::Serialize;
use tower_http::{
    cors::{AllowHeaders, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::context::IndexerContext;

/// JSON body shared by every endpoint: `{"status": "ok", "result": ...}` or
/// `{"status": "error", "error": "..."}`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Body<T> {
    Ok { result: T },
    Error { error: String },
}

/// HTTP status plus body of one API answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply<T> {
    pub code: StatusCode,
    pub body: Body<T>,
}

impl<T> Reply<T> {
    pub fn ok(result: T) -> Self {
        Self {
            code: StatusCode::OK,
            body: Body::Ok { result },
        }
    }

    pub fn accepted(result: T) -> Self {
        Self {
            code: StatusCode::ACCEPTED,
            body: Body::Ok { result },
        }
    }

    pub fn error(code: StatusCode, error: impl Display) -> Self {
        Self {
            code,
            body: Body::Error {
                error: error.to_string(),
            },
        }
    }

    pub fn into_result(self) -> Option<T> {
        match self.body {
            Body::Ok { result } => Some(result),
            Body::Error { .. } => None,
        }
    }
}

impl<T: Serialize> IntoResponse for Reply<T> {
    fn into_response(self) -> axum::response::Response {
        (self.code, Json(self.body)).into_response()
    }
}

/// Read and operator API over the ledger and its checkpoints.
pub struct Server {
    address: String,
    state: HandlerState,
}

impl Server {
    pub fn new(address: String, ctx: IndexerContext) -> Self {
        Self {
            address,
            state: HandlerState { ctx },
        }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_methods(vec![Method::GET, Method::POST])
            .allow_origin(Any)
            .allow_headers(AllowHeaders::any());

        let checkpoint_routes = Router::new()
            .route("/", get(get_checkpoints))
            .route("/{source}/{key}/reset", post(reset_checkpoint))
            .with_state(self.state.clone());

        Router::new()
            .route("/health", get(get_health))
            .route("/transfers", get(get_transfers))
            .route("/position-events", get(get_position_events))
            .route("/pool-events", get(get_pool_events))
            .route("/plan/{source}", get(get_plan))
            .route("/backfill/{source}", post(start_backfill))
            .nest("/checkpoints", checkpoint_routes)
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    pub async fn run(&self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        info!("Listening on http://{}", self.address);
        axum::serve(listener, self.router()).await
    }
}
