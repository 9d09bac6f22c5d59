//! Ledger facade: the entry point an API layer calls.
//!
//! Mutating calls take the ledger lock, execute, commit to the store, queue their logs and
//! return a [`Pending`] whose handle resolves once the logs are durable. Reads go straight
//! to the store and never wait for the lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::LedgerConfig;
use crate::core::account::AccountWithVolumes;
use crate::core::contract::Mapping;
use crate::core::executor::{ExecutionMode, Executor, Prepared};
use crate::core::locker::{InMemoryLocker, LedgerGuard, LockError, Locker};
use crate::core::log::{verify_chain, Log, PersistedLog, TargetType};
use crate::core::metadata::{self, Metadata};
use crate::core::monitor::{Monitor, NoOpMonitor};
use crate::core::pipeline::{LogListener, LogWriter, Pending};
use crate::core::store::{Cursor, StorageError, Store, TransactionsQuery};
use crate::core::transaction::{ExpandedTransaction, ScriptData, TransactionData};
use crate::error::{LedgerError, Result};
use crate::machine::program::{Compiler, JsonCompiler};
use crate::utils::now_truncated;

fn into_transactions(prepared: Vec<Prepared>) -> Vec<ExpandedTransaction> {
    prepared.into_iter().map(|p| p.transaction).collect()
}

/// Ledger counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub transactions: u64,
    pub accounts: u64,
}

/// Options of a mutating call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub preview: bool,
    /// Recorded on every log the call emits.
    pub idempotency_key: Option<String>,
}

impl WriteOptions {
    pub fn preview() -> Self {
        Self {
            preview: true,
            idempotency_key: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    fn mode(&self) -> ExecutionMode {
        ExecutionMode::from_preview(self.preview)
    }
}

pub struct LedgerBuilder {
    store: Arc<dyn Store>,
    config: LedgerConfig,
    locker: Option<Arc<dyn Locker>>,
    compiler: Option<Arc<dyn Compiler>>,
    monitor: Option<Arc<dyn Monitor>>,
    listeners: Vec<Arc<dyn LogListener>>,
}

impl LedgerBuilder {
    pub fn config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares a locker between ledgers. Defaults to a private [`InMemoryLocker`].
    pub fn locker(mut self, locker: Arc<dyn Locker>) -> Self {
        self.locker = Some(locker);
        self
    }

    /// Defaults to [`JsonCompiler`].
    pub fn compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn LogListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Starts the log write-back task. Must be called within a tokio runtime.
    pub fn build(self) -> Ledger {
        let (writer, task) = LogWriter::spawn(self.store.clone(), self.config.log_batch_size, self.listeners);
        let compiler = self.compiler.unwrap_or_else(|| Arc::new(JsonCompiler));
        let executor = Executor::new(self.store.clone(), compiler, writer.clone(), self.config);
        Ledger {
            name: self.store.name().to_string(),
            store: self.store,
            locker: self.locker.unwrap_or_else(|| Arc::new(InMemoryLocker::new())),
            executor,
            monitor: self.monitor.unwrap_or_else(|| Arc::new(NoOpMonitor)),
            writer,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }
    }
}

pub struct Ledger {
    name: String,
    store: Arc<dyn Store>,
    locker: Arc<dyn Locker>,
    executor: Executor,
    monitor: Arc<dyn Monitor>,
    writer: LogWriter,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Ledger {
    pub fn builder(store: Arc<dyn Store>) -> LedgerBuilder {
        LedgerBuilder {
            store,
            config: LedgerConfig::default(),
            locker: None,
            compiler: None,
            monitor: None,
            listeners: Vec::new(),
        }
    }

    /// A ledger with default collaborators.
    pub fn new(store: Arc<dyn Store>, config: LedgerConfig) -> Self {
        Self::builder(store).config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LedgerConfig {
        self.executor.config()
    }

    /// Takes the ledger lock for a mutating call. Fails once the ledger is closed,
    /// including for callers that were already waiting on the lock.
    async fn guard(&self) -> Result<LedgerGuard> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed.into());
        }
        let guard = self.locker.lock(&self.name).await?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed.into());
        }
        Ok(guard)
    }

    /// Executes one script.
    pub async fn execute_script(&self, script: ScriptData, options: WriteOptions) -> Result<Pending<ExpandedTransaction>> {
        let pending = self.execute_scripts(vec![script], options).await?;
        let (mut transactions, handle) = pending.into_parts();
        let transaction = transactions
            .pop()
            .ok_or_else(|| LedgerError::Internal("script produced no transaction".to_string()))?;
        Ok(Pending::new(transaction, handle))
    }

    /// Executes scripts as one batch: all of them commit or none does.
    #[tracing::instrument(skip(self, scripts, options), fields(ledger = %self.name, count = scripts.len(), preview = options.preview))]
    pub async fn execute_scripts(
        &self,
        scripts: Vec<ScriptData>,
        options: WriteOptions,
    ) -> Result<Pending<Vec<ExpandedTransaction>>> {
        let _guard = self.guard().await?;
        let pending = self
            .executor
            .execute_scripts(&scripts, options.mode(), options.idempotency_key.as_deref())
            .await?;
        self.notify(&pending.value, options.preview).await;
        Ok(pending.map(into_transactions))
    }

    /// Executes raw postings as one batch, checked against the ledger's contracts.
    #[tracing::instrument(skip(self, txs_data, options), fields(ledger = %self.name, count = txs_data.len(), preview = options.preview))]
    pub async fn execute_txs_data(
        &self,
        txs_data: Vec<TransactionData>,
        options: WriteOptions,
    ) -> Result<Pending<Vec<ExpandedTransaction>>> {
        let _guard = self.guard().await?;
        let pending = self
            .executor
            .execute_txs_data(&txs_data, options.mode(), options.idempotency_key.as_deref())
            .await?;
        self.notify(&pending.value, options.preview).await;
        Ok(pending.map(into_transactions))
    }

    async fn notify(&self, prepared: &[Prepared], preview: bool) {
        if preview {
            return;
        }
        let transactions: Vec<ExpandedTransaction> = prepared.iter().map(|p| p.transaction.clone()).collect();
        tracing::debug!(count = transactions.len(), "transactions committed");
        self.monitor.committed_transactions(&self.name, &transactions).await;
        for (address, metadata) in prepared.iter().flat_map(|p| p.account_metadata.iter()) {
            self.monitor
                .saved_metadata(&self.name, TargetType::Account, address, metadata)
                .await;
        }
    }

    /// Commits the reverse of transaction `id` and marks `id` as reverted.
    #[tracing::instrument(skip(self), fields(ledger = %self.name))]
    pub async fn revert_transaction(&self, id: u64) -> Result<Pending<ExpandedTransaction>> {
        let _guard = self.guard().await?;
        let mut reverted = self
            .store
            .get_transaction(id)
            .await
            .map_err(|e| LedgerError::storage("getting transaction", e))?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))?;
        if reverted.transaction.is_reverted() {
            return Err(LedgerError::AlreadyReverted(id));
        }

        let mut prepared = self
            .executor
            .prepare_txs_data(&[reverted.transaction.reverse()])
            .await?;
        self.executor.commit(&prepared).await?;
        let revert = prepared
            .pop()
            .ok_or_else(|| LedgerError::Internal("revert produced no transaction".to_string()))?
            .transaction;

        let mut mark = Metadata::new();
        metadata::mark_reverted(&mut mark, revert.id());
        self.store
            .update_transaction_metadata(id, mark.clone())
            .await
            .map_err(|e| LedgerError::storage("marking transaction as reverted", e))?;
        reverted.transaction.metadata.extend(mark);

        let handle = self
            .executor
            .enqueue(vec![Log::reverted_transaction(id, revert.transaction.clone())], None);
        tracing::info!(reverted = id, revert = revert.id(), "transaction reverted");
        self.monitor.reverted_transaction(&self.name, &reverted, &revert).await;
        Ok(Pending::new(revert, handle))
    }

    /// Merges metadata into an account or a transaction.
    #[tracing::instrument(skip(self, metadata), fields(ledger = %self.name))]
    pub async fn save_meta(&self, target_type: &str, target_id: &str, metadata: Metadata) -> Result<Pending<()>> {
        let target_type: TargetType = target_type.parse()?;
        if target_id.is_empty() {
            return Err(LedgerError::validation("empty target id"));
        }

        let _guard = self.guard().await?;
        match target_type {
            TargetType::Transaction => {
                let id: u64 = target_id
                    .parse()
                    .map_err(|_| LedgerError::validation(format!("invalid transaction id '{}'", target_id)))?;
                self.store
                    .update_transaction_metadata(id, metadata.clone())
                    .await
                    .map_err(|e| match e {
                        StorageError::NotFound(what) => LedgerError::NotFound(what),
                        other => LedgerError::storage("updating transaction metadata", other),
                    })?;
            }
            TargetType::Account => {
                self.store
                    .update_account_metadata(target_id, metadata.clone())
                    .await
                    .map_err(|e| LedgerError::storage("updating account metadata", e))?;
            }
        }

        let handle = self.executor.enqueue(
            vec![Log::set_metadata(target_type, target_id, metadata.clone(), now_truncated())],
            None,
        );
        self.monitor
            .saved_metadata(&self.name, target_type, target_id, &metadata)
            .await;
        Ok(Pending::new((), handle))
    }

    pub async fn get_account(&self, address: &str) -> Result<AccountWithVolumes> {
        self.store
            .get_account(address)
            .await
            .map_err(|e| LedgerError::storage("getting account", e))
    }

    pub async fn get_transaction(&self, id: u64) -> Result<ExpandedTransaction> {
        self.store
            .get_transaction(id)
            .await
            .map_err(|e| LedgerError::storage("getting transaction", e))?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", id)))
    }

    pub async fn get_transactions(&self, query: &TransactionsQuery) -> Result<Cursor<ExpandedTransaction>> {
        self.store
            .get_transactions(query)
            .await
            .map_err(|e| LedgerError::storage("getting transactions", e))
    }

    pub async fn stats(&self) -> Result<Stats> {
        let transactions = self
            .store
            .count_transactions()
            .await
            .map_err(|e| LedgerError::storage("counting transactions", e))?;
        let accounts = self
            .store
            .count_accounts()
            .await
            .map_err(|e| LedgerError::storage("counting accounts", e))?;
        Ok(Stats {
            transactions,
            accounts,
        })
    }

    pub async fn load_mapping(&self) -> Result<Option<Mapping>> {
        self.store
            .load_mapping()
            .await
            .map_err(|e| LedgerError::storage("loading mapping", e))
    }

    pub async fn save_mapping(&self, mapping: Mapping) -> Result<()> {
        let _guard = self.guard().await?;
        self.store
            .save_mapping(mapping)
            .await
            .map_err(|e| LedgerError::storage("saving mapping", e))
    }

    pub async fn logs(&self) -> Result<Vec<PersistedLog>> {
        self.store.logs().await.map_err(|e| LedgerError::storage("reading logs", e))
    }

    /// Recomputes the hash chain of the persisted logs.
    pub async fn verify_logs(&self) -> Result<()> {
        let logs = self.logs().await?;
        verify_chain(&logs).map_err(|e| LedgerError::Internal(e.to_string()))
    }

    /// Refuses later writes, waits for the write in flight, flushes pending logs and stops
    /// the write-back task.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        // A closed shared locker has nothing in flight left to wait for.
        let _guard = self.locker.lock(&self.name).await.ok();
        self.writer.stop().await;
        if let Some(task) = self.task.lock().await.take() {
            task.await
                .map_err(|e| LedgerError::Internal(format!("log writer task failed: {}", e)))?;
        }
        tracing::debug!(ledger = %self.name, "ledger closed");
        Ok(())
    }
}
