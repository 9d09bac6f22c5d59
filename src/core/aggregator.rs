//! Pre and post-commit volumes for a batch of transactions.
//!
//! # Invariants
//!
//! - The pre-commit volumes of a pair in transaction `n` equal the post-commit volumes of the
//!   latest earlier transaction of the batch touching that pair, or the stored volumes when
//!   no earlier transaction did.
//! - The store is read at most once per (account, asset) pair per batch.

use crate::core::store::Store;
use crate::core::volumes::{AccountsAssetsVolumes, Volumes};
use crate::error::{LedgerError, Result};
use crate::machine::monetary::MonetaryInt;

/// Volumes of one transaction of the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxVolumes {
    pub pre_commit: AccountsAssetsVolumes,
    pub post_commit: AccountsAssetsVolumes,
}

/// Per-batch aggregator. Records are kept in batch order.
pub struct VolumeAggregator<'a> {
    store: &'a dyn Store,
    txs: Vec<TxVolumes>,
}

impl<'a> VolumeAggregator<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            txs: Vec::new(),
        }
    }

    /// Starts the next transaction of the batch.
    pub fn next_tx(&mut self) {
        self.txs.push(TxVolumes::default());
    }

    /// Volumes of the current transaction.
    pub fn current(&self) -> Option<&TxVolumes> {
        self.txs.last()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    /// Records `amount` of `asset` moving from `from` to `to` in the current transaction.
    pub async fn transfer(&mut self, from: &str, to: &str, asset: &str, amount: &MonetaryInt) -> Result<()> {
        self.load(from, asset).await?;
        self.load(to, asset).await?;
        let current = self.current_mut()?;
        current.post_commit.add_output(from, asset, amount);
        current.post_commit.add_input(to, asset, amount);
        Ok(())
    }

    fn current_mut(&mut self) -> Result<&mut TxVolumes> {
        self.txs
            .last_mut()
            .ok_or_else(|| LedgerError::Internal("transfer recorded before next_tx".to_string()))
    }

    async fn load(&mut self, account: &str, asset: &str) -> Result<()> {
        let (current, previous) = self
            .txs
            .split_last()
            .ok_or_else(|| LedgerError::Internal("transfer recorded before next_tx".to_string()))?;
        if current.pre_commit.has_account_and_asset(account, asset) {
            return Ok(());
        }

        let volumes: Volumes = match previous
            .iter()
            .rev()
            .find_map(|tx| tx.post_commit.get(account, asset))
        {
            Some(volumes) => volumes.clone(),
            None => self
                .store
                .get_volumes(account, asset)
                .await
                .map_err(|e| LedgerError::storage(format!("getting volumes of {}", account), e))?,
        };

        let current = self.current_mut()?;
        current.pre_commit.set_volumes(account, asset, volumes.clone());
        current.post_commit.set_volumes(account, asset, volumes);
        Ok(())
    }
}
