//! RPC cost accounting in provider compute units.

use std::{collections::BTreeMap, sync::Mutex};

use serde::Serialize;

/// Credits that buy one US dollar of provider capacity.
pub const CREDITS_PER_USD: f64 = 10_000_000.0;

/// Compute-unit weight of one request to `method`.
pub fn method_weight(method: &str) -> u64 {
    match method {
        "eth_getLogs" => 20,
        "eth_getBlockByNumber" | "eth_call" => 10,
        "eth_getCode" => 5,
        "eth_getBalance" => 2,
        _ => 1,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MethodCost {
    pub count: u64,
    pub credits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_credits: u64,
    pub usd_estimate: f64,
    pub by_method: BTreeMap<String, MethodCost>,
}

/// Counts endpoint requests per JSON-RPC method, retries included.
#[derive(Debug, Default)]
pub struct CostMeter {
    counts: Mutex<BTreeMap<&'static str, u64>>,
}

impl CostMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, method: &'static str) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(method).or_default() += 1;
    }

    pub fn summary(&self) -> CostSummary {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let by_method: BTreeMap<String, MethodCost> = counts
            .iter()
            .map(|(method, count)| {
                let cost = MethodCost {
                    count: *count,
                    credits: count * method_weight(method),
                };
                (method.to_string(), cost)
            })
            .collect();
        let total_credits = by_method.values().map(|c| c.credits).sum();
        CostSummary {
            total_credits,
            usd_estimate: total_credits as f64 / CREDITS_PER_USD,
            by_method,
        }
    }
}
