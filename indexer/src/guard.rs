use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use serde::Serialize;
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

use crate::error::{GuardError, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardSettings {
    /// Consecutive systemic failures that open the circuit.
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    pub half_open_max_trials: u32,
    pub call_timeout: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_trials: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Circuit {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { in_flight: u32 },
}

/// Timeout plus circuit breaker around every persistence call.
///
/// Row-level rejections pass through and count as healthy responses; only
/// outages, timeouts and open-circuit rejections count as failures.
#[derive(Debug)]
pub struct DurabilityGuard {
    settings: GuardSettings,
    circuit: Mutex<Circuit>,
}

struct TrialPermit<'a> {
    guard: &'a DurabilityGuard,
}

impl Drop for TrialPermit<'_> {
    fn drop(&mut self) {
        let mut circuit = self.guard.lock();
        if let Circuit::HalfOpen { in_flight } = &mut *circuit {
            *in_flight = in_flight.saturating_sub(1);
        }
    }
}

impl DurabilityGuard {
    pub fn new(settings: GuardSettings) -> Self {
        Self {
            settings,
            circuit: Mutex::new(Circuit::Closed { failures: 0 }),
        }
    }

    pub fn state(&self) -> CircuitState {
        match *self.lock() {
            Circuit::Closed { .. } => CircuitState::Closed,
            Circuit::Open { since } if since.elapsed() >= self.settings.reset_timeout => {
                CircuitState::HalfOpen
            }
            Circuit::Open { .. } => CircuitState::Open,
            Circuit::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Runs `call` under the circuit and the call timeout. A call that overruns
    /// is dropped and reported as a timeout.
    pub async fn run<T, F>(&self, op: &'static str, call: F) -> Result<T, GuardError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        let _permit = self.admit(op)?;

        let result = match timeout(self.settings.call_timeout, call).await {
            Ok(result) => result.map_err(GuardError::from),
            Err(_) => Err(GuardError::Timeout(self.settings.call_timeout)),
        };

        match &result {
            Ok(_) => self.record_success(),
            Err(err) if err.is_row() => self.record_success(),
            Err(err) => self.record_failure(op, err),
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Circuit> {
        self.circuit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, op: &'static str) -> Result<Option<TrialPermit<'_>>, GuardError> {
        let mut circuit = self.lock();
        match &mut *circuit {
            Circuit::Closed { .. } => Ok(None),
            Circuit::Open { since } => {
                if since.elapsed() < self.settings.reset_timeout {
                    return Err(GuardError::Open);
                }
                info!(op, "persistence circuit half-open, probing");
                *circuit = Circuit::HalfOpen { in_flight: 1 };
                Ok(Some(TrialPermit { guard: self }))
            }
            Circuit::HalfOpen { in_flight } => {
                if *in_flight >= self.settings.half_open_max_trials {
                    return Err(GuardError::Open);
                }
                *in_flight += 1;
                Ok(Some(TrialPermit { guard: self }))
            }
        }
    }

    fn record_success(&self) {
        let mut circuit = self.lock();
        match &mut *circuit {
            Circuit::Closed { failures } => *failures = 0,
            Circuit::HalfOpen { .. } => {
                info!("persistence circuit closed");
                *circuit = Circuit::Closed { failures: 0 };
            }
            Circuit::Open { .. } => {}
        }
    }

    fn record_failure(&self, op: &'static str, err: &GuardError) {
        let mut circuit = self.lock();
        match &mut *circuit {
            Circuit::Closed { failures } => {
                *failures += 1;
                if *failures >= self.settings.failure_threshold {
                    warn!(op, failures = *failures, error = %err, "persistence circuit opened");
                    *circuit = Circuit::Open {
                        since: Instant::now(),
                    };
                }
            }
            Circuit::HalfOpen { .. } => {
                warn!(op, error = %err, "half-open trial failed, persistence circuit re-opened");
                *circuit = Circuit::Open {
                    since: Instant::now(),
                };
            }
            Circuit::Open { .. } => {}
        }
    }
}
