//! Notifications sent after successful writes.

use async_trait::async_trait;

use crate::core::log::TargetType;
use crate::core::metadata::Metadata;
use crate::core::transaction::ExpandedTransaction;

/// Fire-and-forget observer of ledger writes. Called once the write is committed;
/// implementations must not fail the write.
#[async_trait]
pub trait Monitor: Send + Sync {
    async fn committed_transactions(&self, ledger: &str, transactions: &[ExpandedTransaction]);

    async fn saved_metadata(&self, ledger: &str, target_type: TargetType, target_id: &str, metadata: &Metadata);

    async fn reverted_transaction(&self, ledger: &str, reverted: &ExpandedTransaction, revert: &ExpandedTransaction);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMonitor;

#[async_trait]
impl Monitor for NoOpMonitor {
    async fn committed_transactions(&self, _ledger: &str, _transactions: &[ExpandedTransaction]) {}

    async fn saved_metadata(&self, _ledger: &str, _target_type: TargetType, _target_id: &str, _metadata: &Metadata) {}

    async fn reverted_transaction(&self, _ledger: &str, _reverted: &ExpandedTransaction, _revert: &ExpandedTransaction) {}
}
