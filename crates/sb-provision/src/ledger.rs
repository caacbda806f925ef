//! Credit Ledger
//!
//! External collaborator seam for the platform's credit store. Allocations
//! are idempotency-keyed: re-applying the same key is a no-op that returns
//! the current balance, which is what lets the orchestrator re-invoke an
//! allocation activity after a crash without double-crediting.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct CreditAllocation {
    /// False when the idempotency key had already been applied.
    pub applied: bool,
    pub balance_after: i64,
}

#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn allocate(
        &self,
        tenant_id: &str,
        entity_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> anyhow::Result<CreditAllocation>;

    async fn balance(&self, tenant_id: &str, entity_id: &str) -> anyhow::Result<i64>;
}

pub struct InMemoryCreditLedger {
    balances: DashMap<String, i64>,
    applied_keys: DashSet<String>,
    applications: AtomicU64,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self {
            balances: DashMap::new(),
            applied_keys: DashSet::new(),
            applications: AtomicU64::new(0),
        }
    }

    /// Number of allocations that actually changed a balance (duplicates
    /// excluded).
    pub fn applications(&self) -> u64 {
        self.applications.load(Ordering::SeqCst)
    }

    fn account_key(tenant_id: &str, entity_id: &str) -> String {
        format!("{}:{}", tenant_id, entity_id)
    }
}

impl Default for InMemoryCreditLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn allocate(
        &self,
        tenant_id: &str,
        entity_id: &str,
        amount: i64,
        idempotency_key: &str,
    ) -> anyhow::Result<CreditAllocation> {
        let account = Self::account_key(tenant_id, entity_id);

        if !self.applied_keys.insert(idempotency_key.to_string()) {
            let balance_after = self.balances.get(&account).map(|b| *b).unwrap_or(0);
            debug!(
                tenant_id,
                entity_id, idempotency_key, "Duplicate allocation no-op"
            );
            return Ok(CreditAllocation {
                applied: false,
                balance_after,
            });
        }

        let balance_after = {
            let mut balance = self.balances.entry(account).or_insert(0);
            *balance += amount;
            *balance
        };
        self.applications.fetch_add(1, Ordering::SeqCst);
        debug!(tenant_id, entity_id, amount, balance_after, "Credits allocated");
        Ok(CreditAllocation {
            applied: true,
            balance_after,
        })
    }

    async fn balance(&self, tenant_id: &str, entity_id: &str) -> anyhow::Result<i64> {
        let account = Self::account_key(tenant_id, entity_id);
        Ok(self.balances.get(&account).map(|b| *b).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocation_applies_once_per_idempotency_key() {
        let ledger = InMemoryCreditLedger::new();

        let first = ledger.allocate("T1", "E1", 100, "alloc-1").await.unwrap();
        assert!(first.applied);
        assert_eq!(first.balance_after, 100);

        let duplicate = ledger.allocate("T1", "E1", 100, "alloc-1").await.unwrap();
        assert!(!duplicate.applied);
        assert_eq!(duplicate.balance_after, 100);

        assert_eq!(ledger.applications(), 1);
        assert_eq!(ledger.balance("T1", "E1").await.unwrap(), 100);

        let second = ledger.allocate("T1", "E1", 50, "alloc-2").await.unwrap();
        assert!(second.applied);
        assert_eq!(second.balance_after, 150);
        assert_eq!(ledger.applications(), 2);
    }
}
