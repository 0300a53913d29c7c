use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::watch, task::JoinSet, time::sleep};
use tracing::{debug, error, info};

use crate::{
    config,
    error::{FollowError, FollowGroupError, WindowError},
    meter::CostSummary,
    pipeline::{CheckpointPolicy, WindowPipeline},
    types::PersistStats,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowSettings {
    pub interval: Duration,
    pub max_consecutive_errors: u32,
    /// Stop after this many iterations; `None` runs until stopped.
    pub max_iterations: Option<u64>,
}

impl From<&config::Follow> for FollowSettings {
    fn from(follow: &config::Follow) -> Self {
        Self {
            interval: Duration::from_secs(follow.interval_secs),
            max_consecutive_errors: follow.max_consecutive_errors,
            max_iterations: follow.max_iterations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "iteration", rename_all = "snake_case")]
pub enum FollowState {
    Idle,
    Running(u64),
    Sleeping,
    Stopped,
}

/// Requests a follow loop to stop at its next iteration boundary.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FollowSummary {
    pub iterations: u64,
    pub windows: u64,
    pub stats: PersistStats,
    pub last_checkpoint: Option<u64>,
    pub rpc_cost: CostSummary,
}

/// Repeatedly plans from the live checkpoint and runs every planned window,
/// sleeping `interval` between iterations.
pub struct FollowLoop {
    pipeline: Arc<WindowPipeline>,
    settings: FollowSettings,
    state: FollowState,
    stop: watch::Receiver<bool>,
}

impl FollowLoop {
    pub fn new(pipeline: Arc<WindowPipeline>, settings: FollowSettings) -> (Self, StopHandle) {
        let (sender, stop) = watch::channel(false);
        let follow = Self {
            pipeline,
            settings,
            state: FollowState::Idle,
            stop,
        };
        (follow, StopHandle(Arc::new(sender)))
    }

    pub fn state(&self) -> FollowState {
        self.state
    }

    pub async fn run(&mut self) -> Result<FollowSummary, FollowError> {
        let mut summary = FollowSummary::default();
        let mut consecutive_errors = 0u32;
        let target = self.pipeline.target().clone();
        info!(source = %target.source, key = %target.key, "follow loop started");

        while !self.stop_requested() {
            if self
                .settings
                .max_iterations
                .is_some_and(|max| summary.iterations >= max)
            {
                break;
            }

            summary.iterations += 1;
            self.state = FollowState::Running(summary.iterations);

            match self.iterate(&mut summary).await {
                Ok(windows) => {
                    consecutive_errors = 0;
                    debug!(
                        source = %target.source,
                        iteration = summary.iterations,
                        windows,
                        "follow iteration complete"
                    );
                }
                Err(err) => {
                    consecutive_errors += 1;
                    error!(
                        source = %target.source,
                        iteration = summary.iterations,
                        consecutive_errors,
                        error = %err,
                        "follow iteration failed"
                    );
                    if consecutive_errors >= self.settings.max_consecutive_errors {
                        self.state = FollowState::Stopped;
                        info!(
                            source = %target.source,
                            credits = self.pipeline.fetcher().meter().summary().total_credits,
                            "follow loop giving up"
                        );
                        return Err(FollowError::TooManyErrors {
                            errors: consecutive_errors,
                            last: err,
                        });
                    }
                }
            }

            let finished = self
                .settings
                .max_iterations
                .is_some_and(|max| summary.iterations >= max);
            if finished || self.stop_requested() {
                break;
            }

            self.state = FollowState::Sleeping;
            let stop = &mut self.stop;
            tokio::select! {
                _ = sleep(self.settings.interval) => {}
                _ = stop_signal(stop) => {}
            }
        }

        self.state = FollowState::Stopped;
        summary.rpc_cost = self.pipeline.fetcher().meter().summary();
        info!(
            source = %target.source,
            iterations = summary.iterations,
            windows = summary.windows,
            inserted = summary.stats.inserted,
            credits = summary.rpc_cost.total_credits,
            usd = summary.rpc_cost.usd_estimate,
            "follow loop stopped"
        );
        Ok(summary)
    }

    async fn iterate(&self, summary: &mut FollowSummary) -> Result<usize, WindowError> {
        let plan = self.pipeline.plan(None).await?;
        let target = self.pipeline.target();
        let windows = plan.windows.len();

        for window in plan.windows {
            let report = self
                .pipeline
                .run_window(window, CheckpointPolicy::Advance)
                .await?;
            info!(
                source = %target.source,
                key = %target.key,
                %window,
                logs = report.logs,
                inserted = report.stats.inserted,
                updated = report.stats.updated,
                skipped = report.stats.skipped,
                attempts = report.attempts,
                "window complete"
            );
            summary.windows += 1;
            summary.stats += report.stats;
            summary.last_checkpoint = report.checkpoint.or(summary.last_checkpoint);
        }
        Ok(windows)
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }
}

/// Follow loops for several sources run as one unit: the first loop to fail
/// stops the rest, and its error is what `join` reports.
#[derive(Default)]
pub struct FollowGroup {
    tasks: JoinSet<(String, Result<FollowSummary, FollowError>)>,
    handles: Vec<StopHandle>,
}

impl FollowGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(&mut self, name: impl Into<String>, mut follow: FollowLoop, stop: StopHandle) {
        let name = name.into();
        self.handles.push(stop);
        self.tasks.spawn(async move {
            let result = follow.run().await;
            (name, result)
        });
    }

    pub fn stop_handles(&self) -> Vec<StopHandle> {
        self.handles.clone()
    }

    pub fn stop_all(&self) {
        for handle in &self.handles {
            handle.stop();
        }
    }

    /// Waits for every loop, in completion order.
    pub async fn join(mut self) -> Result<Vec<(String, FollowSummary)>, FollowGroupError> {
        let mut summaries = Vec::new();
        let mut failure = None;

        while let Some(joined) = self.tasks.join_next().await {
            let error = match joined {
                Ok((name, Ok(summary))) => {
                    summaries.push((name, summary));
                    continue;
                }
                Ok((name, Err(error))) => FollowGroupError::Failed { name, error },
                Err(err) => FollowGroupError::Panicked(err.to_string()),
            };
            error!(error = %error, "follow loop ended abnormally");
            if failure.is_none() {
                self.stop_all();
                failure = Some(error);
            }
        }

        match failure {
            Some(error) => Err(error),
            None => Ok(summaries),
        }
    }
}

/// Resolves once a stop is requested. A dropped handle can never request one.
async fn stop_signal(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::Address;

    use super::*;
    use crate::{
        store::MemoryStore,
        test_support::{self, FakeChain, transfer_log},
    };

    fn settings(max_iterations: Option<u64>) -> FollowSettings {
        FollowSettings {
            interval: Duration::from_secs(30),
            max_consecutive_errors: 3,
            max_iterations,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_iteration_plans_nothing_and_writes_nothing() {
        let chain = FakeChain::new(250, vec![transfer_log(120, 0, Address::ZERO, 1)]);
        let store = Arc::new(MemoryStore::new());
        let pipeline = test_support::pipeline(chain.clone(), store.clone(), 100);
        let (mut follow, _stop) = FollowLoop::new(pipeline.clone(), settings(Some(2)));

        let summary = follow.run().await.unwrap();

        assert_eq!(summary.iterations, 2);
        assert_eq!(summary.windows, 3);
        assert_eq!(summary.stats.inserted, 1);
        assert_eq!(summary.stats.updated, 0);
        assert_eq!(chain.get_logs_calls(), 3);
        assert_eq!(follow.state(), FollowState::Stopped);
        assert_eq!(pipeline.checkpoint_block().await.unwrap(), Some(230));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_blocks_are_picked_up_next_iteration() {
        let chain = FakeChain::new(250, Vec::new());
        let store = Arc::new(MemoryStore::new());
        let pipeline = test_support::pipeline(chain.clone(), store.clone(), 100);
        let (mut follow, _stop) = FollowLoop::new(pipeline.clone(), settings(Some(3)));

        let grower = {
            let chain = chain.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(10)).await;
                chain.push_log(transfer_log(260, 0, Address::ZERO, 5));
                chain.set_head(300);
            })
        };

        let summary = follow.run().await.unwrap();
        grower.await.unwrap();

        assert_eq!(summary.last_checkpoint, Some(280));
        assert_eq!(store.transfer_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_errors_stop_the_loop() {
        let chain = FakeChain::new(250, Vec::new());
        chain.fail_next(u32::MAX);
        let store = Arc::new(MemoryStore::new());
        let pipeline = test_support::pipeline(chain, store, 100);
        let (mut follow, _stop) = FollowLoop::new(pipeline, settings(None));

        let err = follow.run().await.unwrap_err();

        let FollowError::TooManyErrors { errors, last } = err;
        assert_eq!(errors, 3);
        assert!(matches!(last, WindowError::Fetch(_)));
        assert_eq!(follow.state(), FollowState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_surfaces_first_failure_and_stops_siblings() {
        let broken = FakeChain::new(250, Vec::new());
        broken.fail_next(u32::MAX);
        let healthy = FakeChain::new(250, Vec::new());

        let mut group = FollowGroup::new();
        // Listed first so an in-order await would block on it forever.
        let (follow, stop) = FollowLoop::new(
            test_support::pipeline(healthy, Arc::new(MemoryStore::new()), 100),
            settings(None),
        );
        group.spawn("healthy", follow, stop);
        let (follow, stop) = FollowLoop::new(
            test_support::pipeline(broken, Arc::new(MemoryStore::new()), 100),
            settings(None),
        );
        group.spawn("broken", follow, stop);

        let err = group.join().await.unwrap_err();
        let FollowGroupError::Failed { name, error } = err else {
            panic!("expected a failed loop");
        };
        assert_eq!(name, "broken");
        assert!(matches!(error, FollowError::TooManyErrors { errors: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_returns_every_summary() {
        let mut group = FollowGroup::new();
        for name in ["a", "b"] {
            let chain = FakeChain::new(250, Vec::new());
            let (follow, stop) = FollowLoop::new(
                test_support::pipeline(chain, Arc::new(MemoryStore::new()), 100),
                settings(Some(1)),
            );
            group.spawn(name, follow, stop);
        }

        let mut names: Vec<String> = group
            .join()
            .await
            .unwrap()
            .into_iter()
            .map(|(name, summary)| {
                assert_eq!(summary.last_checkpoint, Some(230));
                assert_eq!(summary.rpc_cost.by_method["eth_getLogs"].count, 3);
                name
            })
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_sleep() {
        let chain = FakeChain::new(250, Vec::new());
        let store = Arc::new(MemoryStore::new());
        let pipeline = test_support::pipeline(chain, store, 100);
        let (mut follow, stop) = FollowLoop::new(
            pipeline,
            FollowSettings {
                interval: Duration::from_secs(3_600),
                ..settings(None)
            },
        );

        let started = tokio::time::Instant::now();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            stop.stop();
        });

        let summary = follow.run().await.unwrap();

        assert_eq!(summary.iterations, 1);
        assert!(started.elapsed() < Duration::from_secs(3_600));
    }
}
