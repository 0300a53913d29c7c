use std::sync::Arc;

use alloy::primitives::Address;

use crate::{error::GuardError, guard::DurabilityGuard, store::EventReader};

/// Pools recorded by a factory scan, optionally narrowed to an allowlist.
pub struct PoolRegistry {
    reader: Arc<dyn EventReader>,
    guard: Arc<DurabilityGuard>,
    allowlist: Vec<Address>,
}

impl PoolRegistry {
    pub fn new(reader: Arc<dyn EventReader>, guard: Arc<DurabilityGuard>) -> Self {
        Self {
            reader,
            guard,
            allowlist: Vec::new(),
        }
    }

    /// Keeps only these pools; an empty list keeps every created pool.
    #[must_use]
    pub fn with_allowlist(mut self, allowlist: Vec<Address>) -> Self {
        self.allowlist = allowlist;
        self
    }

    /// Created pools in address order.
    pub async fn pools(&self) -> Result<Vec<Address>, GuardError> {
        let mut pools = self
            .guard
            .run("created_pools", self.reader.created_pools())
            .await?;
        if !self.allowlist.is_empty() {
            pools.retain(|pool| self.allowlist.contains(pool));
        }
        Ok(pools)
    }
}
