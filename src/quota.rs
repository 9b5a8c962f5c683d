//! Tile quota gate, consulted before a tile job is queued.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::document::OrganizationId;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDecision {
    pub allowed: bool,
    /// Tiles left after this decision.
    pub remaining: u64,
}

#[async_trait]
pub trait QuotaGate: Send + Sync {
    /// Ask to spend `tile_count` tiles. An allowed decision consumes them.
    async fn check(&self, organization: OrganizationId, tile_count: u64) -> Result<QuotaDecision>;

    /// Return tiles from an allowed decision whose job was never created.
    async fn release(&self, _organization: OrganizationId, _tile_count: u64) -> Result<()> {
        Ok(())
    }
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaGate for UnlimitedQuota {
    async fn check(&self, _organization: OrganizationId, _tile_count: u64) -> Result<QuotaDecision> {
        Ok(QuotaDecision {
            allowed: true,
            remaining: u64::MAX,
        })
    }
}

/// Fixed tile allowance per organization, decremented on approval.
pub struct FixedQuota {
    default_allowance: u64,
    remaining: Mutex<HashMap<OrganizationId, u64>>,
}

impl FixedQuota {
    pub fn new(default_allowance: u64) -> Self {
        Self {
            default_allowance,
            remaining: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_allowance(&self, organization: OrganizationId, tiles: u64) {
        self.remaining.lock().insert(organization, tiles);
    }

    pub fn remaining(&self, organization: OrganizationId) -> u64 {
        self.remaining
            .lock()
            .get(&organization)
            .copied()
            .unwrap_or(self.default_allowance)
    }
}

#[async_trait]
impl QuotaGate for FixedQuota {
    async fn check(&self, organization: OrganizationId, tile_count: u64) -> Result<QuotaDecision> {
        let mut remaining = self.remaining.lock();
        let left = remaining
            .entry(organization)
            .or_insert(self.default_allowance);
        if tile_count > *left {
            return Ok(QuotaDecision {
                allowed: false,
                remaining: *left,
            });
        }
        *left -= tile_count;
        Ok(QuotaDecision {
            allowed: true,
            remaining: *left,
        })
    }

    async fn release(&self, organization: OrganizationId, tile_count: u64) -> Result<()> {
        let mut remaining = self.remaining.lock();
        let left = remaining
            .entry(organization)
            .or_insert(self.default_allowance);
        *left = left.saturating_add(tile_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_quota_decrements_and_rejects() {
        let quota = FixedQuota::new(100);
        let org = OrganizationId::new();

        let first = quota.check(org, 60).await.unwrap();
        assert_eq!(first, QuotaDecision { allowed: true, remaining: 40 });

        let second = quota.check(org, 41).await.unwrap();
        assert_eq!(second, QuotaDecision { allowed: false, remaining: 40 });

        quota.release(org, 60).await.unwrap();
        assert_eq!(quota.remaining(org), 100);
        assert_eq!(quota.remaining(OrganizationId::new()), 100);
    }

    #[tokio::test]
    async fn test_unlimited_always_allows() {
        let decision = UnlimitedQuota.check(OrganizationId::new(), u64::MAX).await.unwrap();
        assert!(decision.allowed);
    }
}
