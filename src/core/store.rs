//! Storage interface of a ledger and its in-memory implementation.
//!
//! The executor only talks to storage through [`Store`]. Implementations report uniqueness
//! violations (duplicate reference, duplicate transaction id, broken log sequence) as
//! [`StorageError::ConstraintFailed`] so callers can tell them apart from I/O failures.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::account::AccountWithVolumes;
use crate::core::contract::Mapping;
use crate::core::log::PersistedLog;
use crate::core::metadata::Metadata;
use crate::core::transaction::{ExpandedTransaction, Transaction};
use crate::core::volumes::{AccountsAssetsVolumes, Volumes};

/// Page size used when a query does not set one.
pub const DEFAULT_PAGE_SIZE: usize = 15;

/// Largest page a query may ask for.
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("constraint failed: {0}")]
    ConstraintFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage backend: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_constraint_failed(&self) -> bool {
        matches!(self, StorageError::ConstraintFailed(_))
    }
}

/// Filters for listing transactions. Results are ordered by descending id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransactionsQuery {
    pub reference: Option<String>,
    /// Matches postings where the account is either source or destination.
    pub account: Option<String>,
    pub source: Option<String>,
    pub destination: Option<String>,
    /// Inclusive lower bound.
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper bound.
    pub end_time: Option<DateTime<Utc>>,
    /// Only transactions with an id strictly lower than this one.
    pub after_id: Option<u64>,
    pub page_size: usize,
}

impl TransactionsQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_time_range(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_after_id(mut self, id: u64) -> Self {
        self.after_id = Some(id);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Effective page size, defaulted and capped.
    pub fn effective_page_size(&self) -> usize {
        match self.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        }
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        if let Some(reference) = self.reference.as_deref().filter(|r| !r.is_empty()) {
            if tx.reference() != Some(reference) {
                return false;
            }
        }
        if let Some(account) = &self.account {
            if !tx
                .postings
                .iter()
                .any(|p| &p.source == account || &p.destination == account)
            {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if !tx.postings.iter().any(|p| &p.source == source) {
                return false;
            }
        }
        if let Some(destination) = &self.destination {
            if !tx.postings.iter().any(|p| &p.destination == destination) {
                return false;
            }
        }
        if self.start_time.map_or(false, |start| tx.timestamp < start) {
            return false;
        }
        if self.end_time.map_or(false, |end| tx.timestamp >= end) {
            return false;
        }
        if self.after_id.map_or(false, |after| tx.id >= after) {
            return false;
        }
        true
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor<T> {
    pub page_size: usize,
    pub has_more: bool,
    /// Pass as `after_id` to fetch the next page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<u64>,
    pub data: Vec<T>,
}

impl<T> Cursor<T> {
    pub fn empty(page_size: usize) -> Self {
        Self {
            page_size,
            has_more: false,
            next: None,
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Persistence used by a ledger.
#[async_trait]
pub trait Store: Send + Sync {
    /// Name of the ledger this store holds.
    fn name(&self) -> &str;

    async fn get_last_transaction(&self) -> Result<Option<Transaction>, StorageError>;

    async fn get_transaction(&self, id: u64) -> Result<Option<ExpandedTransaction>, StorageError>;

    async fn get_transactions(&self, query: &TransactionsQuery) -> Result<Cursor<ExpandedTransaction>, StorageError>;

    async fn count_transactions(&self) -> Result<u64, StorageError>;

    /// Account with its metadata and volumes. Unknown accounts come back empty.
    async fn get_account(&self, address: &str) -> Result<AccountWithVolumes, StorageError>;

    async fn get_volumes(&self, account: &str, asset: &str) -> Result<Volumes, StorageError>;

    async fn count_accounts(&self) -> Result<u64, StorageError>;

    async fn load_mapping(&self) -> Result<Option<Mapping>, StorageError>;

    async fn save_mapping(&self, mapping: Mapping) -> Result<(), StorageError>;

    /// Stores the transactions, applies their postings to account volumes and merges
    /// `account_metadata` into the named accounts, all or nothing.
    async fn commit(
        &self,
        transactions: &[ExpandedTransaction],
        account_metadata: &[(String, Metadata)],
    ) -> Result<(), StorageError>;

    /// Merges `metadata` into the transaction's metadata.
    async fn update_transaction_metadata(&self, id: u64, metadata: Metadata) -> Result<(), StorageError>;

    /// Merges `metadata` into the account's metadata, creating the account if needed.
    async fn update_account_metadata(&self, address: &str, metadata: Metadata) -> Result<(), StorageError>;

    async fn last_log(&self) -> Result<Option<PersistedLog>, StorageError>;

    /// Appends logs that must directly follow [`Store::last_log`].
    async fn append_logs(&self, logs: &[PersistedLog]) -> Result<(), StorageError>;

    async fn logs(&self) -> Result<Vec<PersistedLog>, StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    transactions: BTreeMap<u64, ExpandedTransaction>,
    references: HashMap<String, u64>,
    accounts: BTreeMap<String, Metadata>,
    volumes: AccountsAssetsVolumes,
    mapping: Option<Mapping>,
    logs: Vec<PersistedLog>,
}

/// Process-local [`Store`] backed by ordered maps.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_last_transaction(&self) -> Result<Option<Transaction>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .values()
            .next_back()
            .map(|tx| tx.transaction.clone()))
    }

    async fn get_transaction(&self, id: u64) -> Result<Option<ExpandedTransaction>, StorageError> {
        Ok(self.state.read().await.transactions.get(&id).cloned())
    }

    async fn get_transactions(&self, query: &TransactionsQuery) -> Result<Cursor<ExpandedTransaction>, StorageError> {
        let page_size = query.effective_page_size();
        let state = self.state.read().await;

        let candidates: Box<dyn Iterator<Item = &ExpandedTransaction> + '_> =
            match query.reference.as_deref().filter(|r| !r.is_empty()) {
                Some(reference) => Box::new(
                    state
                        .references
                        .get(reference)
                        .and_then(|id| state.transactions.get(id))
                        .into_iter(),
                ),
                None => Box::new(state.transactions.values().rev()),
            };

        let mut data: Vec<ExpandedTransaction> = candidates
            .filter(|tx| query.matches(&tx.transaction))
            .take(page_size + 1)
            .cloned()
            .collect();
        let has_more = data.len() > page_size;
        data.truncate(page_size);
        let next = if has_more { data.last().map(|tx| tx.id()) } else { None };

        Ok(Cursor {
            page_size,
            has_more,
            next,
            data,
        })
    }

    async fn count_transactions(&self) -> Result<u64, StorageError> {
        Ok(self.state.read().await.transactions.len() as u64)
    }

    async fn get_account(&self, address: &str) -> Result<AccountWithVolumes, StorageError> {
        let state = self.state.read().await;
        let metadata = state.accounts.get(address).cloned().unwrap_or_default();
        let volumes = state.volumes.account(address).cloned().unwrap_or_default();
        Ok(AccountWithVolumes::new(address, metadata, volumes))
    }

    async fn get_volumes(&self, account: &str, asset: &str) -> Result<Volumes, StorageError> {
        Ok(self.state.read().await.volumes.get_volumes(account, asset))
    }

    async fn count_accounts(&self) -> Result<u64, StorageError> {
        Ok(self.state.read().await.accounts.len() as u64)
    }

    async fn load_mapping(&self) -> Result<Option<Mapping>, StorageError> {
        Ok(self.state.read().await.mapping.clone())
    }

    async fn save_mapping(&self, mapping: Mapping) -> Result<(), StorageError> {
        self.state.write().await.mapping = Some(mapping);
        Ok(())
    }

    async fn commit(
        &self,
        transactions: &[ExpandedTransaction],
        account_metadata: &[(String, Metadata)],
    ) -> Result<(), StorageError> {
        let mut state = self.state.write().await;

        let mut batch_references = HashMap::new();
        for expanded in transactions {
            let id = expanded.id();
            if state.transactions.contains_key(&id) {
                return Err(StorageError::ConstraintFailed(format!("duplicate transaction id {}", id)));
            }
            if let Some(reference) = expanded.transaction.reference() {
                if state.references.contains_key(reference)
                    || batch_references.insert(reference.to_string(), id).is_some()
                {
                    return Err(StorageError::ConstraintFailed(format!(
                        "duplicate transaction reference {}",
                        reference
                    )));
                }
            }
        }

        for expanded in transactions {
            for posting in &expanded.transaction.postings {
                state.volumes.add_output(&posting.source, &posting.asset, &posting.amount);
                state.volumes.add_input(&posting.destination, &posting.asset, &posting.amount);
                for address in [&posting.source, &posting.destination] {
                    if !state.accounts.contains_key(address) {
                        state.accounts.insert(address.clone(), Metadata::new());
                    }
                }
            }
            state.transactions.insert(expanded.id(), expanded.clone());
        }
        state.references.extend(batch_references);
        for (address, metadata) in account_metadata {
            state.accounts.entry(address.clone()).or_default().extend(metadata.clone());
        }
        Ok(())
    }

    async fn update_transaction_metadata(&self, id: u64, metadata: Metadata) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let expanded = state
            .transactions
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("transaction {}", id)))?;
        expanded.transaction.metadata.extend(metadata);
        Ok(())
    }

    async fn update_account_metadata(&self, address: &str, metadata: Metadata) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        state.accounts.entry(address.to_string()).or_default().extend(metadata);
        Ok(())
    }

    async fn last_log(&self) -> Result<Option<PersistedLog>, StorageError> {
        Ok(self.state.read().await.logs.last().cloned())
    }

    async fn append_logs(&self, logs: &[PersistedLog]) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        let mut expected = state.logs.last().map_or(0, |last| last.id + 1);
        for log in logs {
            if log.id != expected {
                return Err(StorageError::ConstraintFailed(format!(
                    "log {} does not follow log sequence, expected {}",
                    log.id, expected
                )));
            }
            expected += 1;
        }
        state.logs.extend_from_slice(logs);
        Ok(())
    }

    async fn logs(&self) -> Result<Vec<PersistedLog>, StorageError> {
        Ok(self.state.read().await.logs.clone())
    }
}
