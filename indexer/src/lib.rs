pub mod backfill;
pub mod chain;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod decoder;
pub mod error;
pub mod fetcher;
pub mod follow;
pub mod guard;
pub mod meter;
pub mod pipeline;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod writer;

#[cfg(test)]
pub(crate) mod test_support;
