use std::time::Duration;

use thiserror::Error;

use crate::types::{EventId, PersistStats, Window};

/// Failure of a single call against one log-source endpoint.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("json-rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Transient failures are retried; client errors other than 429 and
    /// invalid JSON-RPC requests are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SourceError::Transport(_) | SourceError::Malformed(_) => true,
            SourceError::Http { status, .. } => *status == 429 || !(400..500).contains(status),
            // 3 is a reverted eth_call: asking again yields the same revert.
            SourceError::Rpc { code, .. } => !matches!(code, -32600 | -32601 | -32602 | 3),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{op} rejected by {endpoint}: {source}")]
    NonRetryable {
        op: &'static str,
        endpoint: String,
        source: SourceError,
    },
    #[error("{op} failed after {attempts} attempts: {last}")]
    Exhausted {
        op: &'static str,
        attempts: u32,
        last: SourceError,
    },
    #[error("no log source endpoints configured")]
    NoEndpoints,
}

/// Malformed payload for a recognized event signature.
#[derive(Debug, Clone, Error)]
#[error("malformed {event} log {id}: {reason}")]
pub struct DecodeError {
    pub event: &'static str,
    pub id: EventId,
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The row itself was rejected (constraint or data error). Siblings are unaffected.
    #[error("row rejected: {0}")]
    Row(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A read filter that names no known value.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let class = db.code().map(|c| c.chars().take(2).collect::<String>());
                match class.as_deref() {
                    Some("22") | Some("23") => StoreError::Row(db.message().to_string()),
                    _ => StoreError::Unavailable(err.to_string()),
                }
            }
            sqlx::Error::Encode(_) | sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
                StoreError::Row(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GuardError {
    #[error("persistence circuit is open")]
    Open,
    #[error("persistence call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Inner(#[from] StoreError),
}

impl GuardError {
    pub fn is_row(&self) -> bool {
        matches!(self, GuardError::Inner(StoreError::Row(_)))
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("store unavailable after {} rows written: {source}", .stats.written())]
    Unavailable {
        stats: PersistStats,
        source: GuardError,
    },
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("max_window_size must be greater than zero")]
    ZeroWindowSize,
    #[error("range end {to} is before start {from}")]
    InvalidRange { from: u64, to: u64 },
}

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("persist failed: {0}")]
    Persist(#[from] PersistError),
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] GuardError),
    #[error("pool registry unavailable: {0}")]
    Discovery(#[source] GuardError),
    #[error(transparent)]
    Plan(#[from] PlanError),
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("window {window} failed after {attempts} attempts: {source}")]
    Window {
        window: Window,
        attempts: u32,
        source: WindowError,
    },
    #[error("planning failed: {0}")]
    Planning(#[source] WindowError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum FollowError {
    #[error("follow loop stopped after {errors} consecutive errors: {last}")]
    TooManyErrors { errors: u32, last: WindowError },
}

/// Failure of one loop in a group of follow loops run side by side.
#[derive(Debug, Error)]
pub enum FollowGroupError {
    #[error("follow loop {name} failed: {error}")]
    Failed {
        name: String,
        #[source]
        error: FollowError,
    },
    #[error("follow task panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("contract call failed: {0}")]
    Call(String),
    #[error("position {0} does not exist")]
    UnknownPosition(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unknown source: {0}")]
    UnknownSource(String),
}
