use std::sync::Arc;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    error::BackfillError,
    meter::CostSummary,
    pipeline::{CheckpointPolicy, WindowPipeline, WindowReport, WindowStage},
    types::{PersistStats, Window},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "window", rename_all = "snake_case")]
pub enum BackfillState {
    Planning,
    Scanning(Window),
    Persisting(Window),
    Checkpointing(Window),
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillReport {
    pub source: String,
    pub key: String,
    /// Explicit `[from, to]` range, `None` for a checkpoint-driven run.
    pub range: Option<Window>,
    pub windows: Vec<WindowReport>,
    pub stats: PersistStats,
    pub last_checkpoint: Option<u64>,
    /// Priced requests of this run, retries included.
    pub rpc_cost: CostSummary,
}

/// Drives the pipeline over every planned window once, retrying each window a
/// bounded number of times and halting on the first window that cannot be
/// completed. Windows are never skipped.
pub struct Backfill {
    pipeline: Arc<WindowPipeline>,
    window_retries: u32,
    state: BackfillState,
}

impl Backfill {
    pub fn new(pipeline: Arc<WindowPipeline>, window_retries: u32) -> Self {
        Self {
            pipeline,
            window_retries: window_retries.max(1),
            state: BackfillState::Planning,
        }
    }

    pub fn state(&self) -> BackfillState {
        self.state
    }

    /// Backfills from the stored checkpoint up to the safe head.
    pub async fn run(&mut self) -> Result<BackfillReport, BackfillError> {
        self.execute(None).await
    }

    /// Backfills `[from, to]`. The checkpoint only moves for windows that are
    /// contiguous with it.
    pub async fn run_range(&mut self, from: u64, to: u64) -> Result<BackfillReport, BackfillError> {
        self.execute(Some(Window::new(from, to))).await
    }

    async fn execute(&mut self, range: Option<Window>) -> Result<BackfillReport, BackfillError> {
        let pipeline = self.pipeline.clone();
        let target = pipeline.target();
        self.transition(BackfillState::Planning);

        let (plan, policy) = match range {
            Some(range) => (
                pipeline.plan_range(range.from, range.to).await,
                CheckpointPolicy::Contiguous,
            ),
            None => (pipeline.plan(None).await, CheckpointPolicy::Advance),
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(err) => {
                self.transition(BackfillState::Failed);
                error!(source = %target.source, key = %target.key, error = %err, "backfill planning failed");
                return Err(BackfillError::Planning(err));
            }
        };

        info!(
            source = %target.source,
            key = %target.key,
            from_block = plan.from_block,
            safe_head = plan.safe_head,
            windows = plan.windows.len(),
            "backfill planned"
        );

        let mut report = BackfillReport {
            source: target.source.clone(),
            key: target.key.clone(),
            range,
            windows: Vec::with_capacity(plan.windows.len()),
            stats: PersistStats::default(),
            last_checkpoint: None,
            rpc_cost: CostSummary::default(),
        };

        for window in plan.windows {
            let window_report = self.run_with_retries(&pipeline, window, policy).await?;
            info!(
                source = %target.source,
                key = %target.key,
                %window,
                logs = window_report.logs,
                decoded = window_report.decoded,
                inserted = window_report.stats.inserted,
                updated = window_report.stats.updated,
                skipped = window_report.stats.skipped,
                attempts = window_report.attempts,
                checkpoint = ?window_report.checkpoint,
                "window complete"
            );
            report.stats += window_report.stats;
            report.last_checkpoint = window_report.checkpoint.or(report.last_checkpoint);
            report.windows.push(window_report);
        }

        report.rpc_cost = pipeline.fetcher().meter().summary();
        info!(
            source = %target.source,
            key = %target.key,
            credits = report.rpc_cost.total_credits,
            usd = report.rpc_cost.usd_estimate,
            "backfill rpc cost"
        );
        self.transition(BackfillState::Done);
        Ok(report)
    }

    async fn run_with_retries(
        &mut self,
        pipeline: &WindowPipeline,
        window: Window,
        policy: CheckpointPolicy,
    ) -> Result<WindowReport, BackfillError> {
        let backoff = *pipeline.fetcher().policy();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = pipeline
                .run_window_observed(window, policy, |stage| {
                    self.transition(match stage {
                        WindowStage::Scanning => BackfillState::Scanning(window),
                        WindowStage::Persisting => BackfillState::Persisting(window),
                        WindowStage::Checkpointing => BackfillState::Checkpointing(window),
                    })
                })
                .await;

            match result {
                Ok(report) => return Ok(report),
                Err(err) if attempt < self.window_retries => {
                    let delay = backoff.backoff(attempt - 1);
                    warn!(
                        %window,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "window failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    self.transition(BackfillState::Failed);
                    error!(%window, attempts = attempt, error = %err, "window failed, halting backfill");
                    return Err(BackfillError::Window {
                        window,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }

    fn transition(&mut self, next: BackfillState) {
        debug!(from = ?self.state, to = ?next, "backfill state");
        self.state = next;
    }
}
