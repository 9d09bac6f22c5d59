//! Script and transaction-data execution against one ledger.
//!
//! Every call runs while the caller holds the ledger lock. A batch is executed in order:
//!
//! 1. read the last transaction, which gives the next id and the timestamp baseline,
//! 2. per item: check the timestamp, then the reference, then run the script (or check
//!    contracts for raw postings), then aggregate volumes,
//! 3. unless previewing, commit the batch to the store and queue its logs.
//!
//! # Invariants
//!
//! - Ids are `last + 1, last + 2, ...` in batch order, starting at 0 on an empty ledger.
//! - A reference used twice, in the batch or in the store, fails the whole batch.
//! - Preview runs the same checks and never writes.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::LedgerConfig;
use crate::core::account::{AccountWithVolumes, WORLD};
use crate::core::aggregator::VolumeAggregator;
use crate::core::asset::Asset;
use crate::core::cache::ProgramCache;
use crate::core::contract::{default_contracts, Contract, EvalContext};
use crate::core::log::Log;
use crate::core::metadata::Metadata;
use crate::core::pipeline::{LogHandle, LogWriter, Pending};
use crate::core::store::{Store, TransactionsQuery};
use crate::core::transaction::{ExpandedTransaction, Postings, ScriptData, Transaction, TransactionData};
use crate::core::volumes::AccountsAssetsVolumes;
use crate::error::{LedgerError, Result, ScriptError, ScriptErrorCode};
use crate::machine::monetary::MonetaryInt;
use crate::machine::program::Compiler;
use crate::machine::vm::{ExitCode, Machine, ResourceResolver};
use crate::utils::{format_duration, now_truncated};

/// Whether a call writes its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Commit to the store and queue logs.
    Commit,
    /// Compute the would-be transactions only.
    Preview,
}

impl ExecutionMode {
    pub fn from_preview(preview: bool) -> Self {
        if preview {
            ExecutionMode::Preview
        } else {
            ExecutionMode::Commit
        }
    }
}

/// A transaction ready to be committed, with the account metadata its script set.
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub transaction: ExpandedTransaction,
    pub account_metadata: BTreeMap<String, Metadata>,
}

/// Accounts read during one batch. Cached accounts are kept in sync with the batch's
/// post-commit volumes so later items see earlier ones.
struct AccountCache<'a> {
    store: &'a dyn Store,
    accounts: HashMap<String, AccountWithVolumes>,
}

impl<'a> AccountCache<'a> {
    fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            accounts: HashMap::new(),
        }
    }

    async fn account(&mut self, address: &str) -> Result<&mut AccountWithVolumes> {
        match self.accounts.entry(address.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let account = self
                    .store
                    .get_account(address)
                    .await
                    .map_err(|e| LedgerError::storage(format!("could not get account {:?}", address), e))?;
                Ok(entry.insert(account))
            }
        }
    }

    async fn apply(&mut self, volumes: &AccountsAssetsVolumes) -> Result<()> {
        for (address, assets) in volumes.iter() {
            let account = self.account(address).await?;
            for (asset, v) in assets {
                account.balances.insert(asset.clone(), v.balance());
                account.volumes.insert(asset.clone(), v.clone());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> ResourceResolver for AccountCache<'a> {
    async fn account_metadata(&mut self, account: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.account(account).await?.metadata.get(key).cloned())
    }

    async fn account_balance(&mut self, account: &str, asset: &Asset) -> Result<MonetaryInt> {
        Ok(self.account(account).await?.balance(asset.as_str()))
    }
}

/// Id, timestamp and reference bookkeeping across one batch.
struct BatchCursor {
    next_id: u64,
    last_timestamp: Option<DateTime<Utc>>,
    references: HashSet<String>,
    allow_past_timestamps: bool,
}

impl BatchCursor {
    fn new(last: Option<&Transaction>, allow_past_timestamps: bool) -> Self {
        Self {
            next_id: last.map_or(0, |tx| tx.id + 1),
            last_timestamp: last.map(|tx| tx.timestamp),
            references: HashSet::new(),
            allow_past_timestamps,
        }
    }

    /// Defaults a missing timestamp to now and enforces ordering.
    fn timestamp(&mut self, requested: Option<DateTime<Utc>>) -> Result<DateTime<Utc>> {
        let timestamp = requested.unwrap_or_else(now_truncated);
        if let Some(last) = self.last_timestamp {
            if timestamp < last && !self.allow_past_timestamps {
                return Err(LedgerError::validation(format!(
                    "cannot pass a timestamp prior to the last transaction: {} (passed) is {} before {} (last)",
                    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                    format_duration(last - timestamp),
                    last.to_rfc3339_opts(SecondsFormat::AutoSi, true),
                )));
            }
        }
        self.last_timestamp = Some(timestamp);
        Ok(timestamp)
    }

    fn claim_reference(&mut self, reference: &str) -> Result<()> {
        if !self.references.insert(reference.to_string()) {
            return Err(LedgerError::Conflict {
                reference: reference.to_string(),
            });
        }
        Ok(())
    }

    fn take_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

pub struct Executor {
    store: Arc<dyn Store>,
    compiler: Arc<dyn Compiler>,
    cache: ProgramCache,
    writer: LogWriter,
    config: LedgerConfig,
}

impl Executor {
    pub fn new(store: Arc<dyn Store>, compiler: Arc<dyn Compiler>, writer: LogWriter, config: LedgerConfig) -> Self {
        Self {
            store,
            compiler,
            cache: ProgramCache::new(config.program_cache_max_cost),
            writer,
            config,
        }
    }

    pub fn cache(&self) -> &ProgramCache {
        &self.cache
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    async fn last_transaction(&self) -> Result<Option<Transaction>> {
        self.store
            .get_last_transaction()
            .await
            .map_err(|e| LedgerError::storage("could not get last transaction", e))
    }

    async fn check_reference(&self, cursor: &mut BatchCursor, reference: Option<&str>) -> Result<()> {
        let Some(reference) = reference else {
            return Ok(());
        };
        cursor.claim_reference(reference)?;
        let existing = self
            .store
            .get_transactions(&TransactionsQuery::new().with_reference(reference).with_page_size(1))
            .await
            .map_err(|e| LedgerError::storage("getting transactions by reference", e))?;
        if !existing.is_empty() {
            return Err(LedgerError::Conflict {
                reference: reference.to_string(),
            });
        }
        Ok(())
    }

    /// Runs scripts without writing anything.
    pub async fn prepare_scripts(&self, scripts: &[ScriptData]) -> Result<Vec<Prepared>> {
        if scripts.is_empty() {
            return Err(ScriptError::new(ScriptErrorCode::NoScript, "no script to execute").into());
        }

        let last = self.last_transaction().await?;
        let mut cursor = BatchCursor::new(last.as_ref(), self.config.allow_past_timestamps);
        let mut accounts = AccountCache::new(self.store.as_ref());
        let mut aggregator = VolumeAggregator::new(self.store.as_ref());
        let mut prepared = Vec::with_capacity(scripts.len());

        for script in scripts {
            let timestamp = cursor.timestamp(script.timestamp)?;
            self.check_reference(&mut cursor, script.reference()).await?;
            if script.plain.is_empty() {
                return Err(ScriptError::new(ScriptErrorCode::NoScript, "no script to execute").into());
            }

            let program = self
                .cache
                .get_or_compile(&script.plain, self.compiler.as_ref())
                .map_err(|e| ScriptError::new(ScriptErrorCode::CompilationFailed, e.to_string()))?;
            let mut machine = Machine::new(program);
            machine.set_vars_from_json(&script.vars).map_err(|e| {
                ScriptError::new(
                    ScriptErrorCode::CompilationFailed,
                    format!("could not set variables: {}", e),
                )
            })?;
            machine.resolve_resources(&mut accounts).await?;
            machine.resolve_balances(&mut accounts).await?;

            let exit_code = machine
                .execute()
                .map_err(|e| LedgerError::Internal(format!("script execution failed: {}", e)))?;
            match exit_code {
                ExitCode::Ok => {}
                ExitCode::Fail => {
                    return Err(LedgerError::ScriptFailed(format!(
                        "script exited with error code {}",
                        exit_code
                    )))
                }
                ExitCode::FailInvalid => {
                    tracing::error!(reason = machine.failure_reason(), "compiled script was invalid");
                    return Err(LedgerError::Internal("compiled script was invalid".to_string()));
                }
                ExitCode::FailInsufficientFunds => {
                    return Err(ScriptError::new(
                        ScriptErrorCode::InsufficientFund,
                        "account had insufficient funds",
                    )
                    .into())
                }
            }

            let postings = Postings(machine.postings().to_vec());
            if postings.is_empty() {
                return Err(LedgerError::validation("transaction has no postings"));
            }

            aggregator.next_tx();
            for posting in &postings {
                aggregator
                    .transfer(&posting.source, &posting.destination, &posting.asset, &posting.amount)
                    .await?;
            }
            let volumes = aggregator
                .current()
                .cloned()
                .ok_or_else(|| LedgerError::Internal("missing transaction volumes".to_string()))?;
            accounts.apply(&volumes.post_commit).await?;

            let mut metadata = machine
                .tx_meta_json()
                .map_err(|e| LedgerError::Internal(format!("encoding transaction metadata: {}", e)))?;
            for (key, value) in &script.metadata {
                if metadata.contains_key(key) {
                    return Err(ScriptError::new(
                        ScriptErrorCode::MetadataOverride,
                        "cannot override metadata from script",
                    )
                    .into());
                }
                metadata.insert(key.clone(), value.clone());
            }

            let account_metadata = machine
                .account_meta_json()
                .map_err(|e| LedgerError::Internal(format!("encoding account metadata: {}", e)))?
                .into_iter()
                .map(|(account, meta)| {
                    let account = account.strip_prefix('@').map(str::to_string).unwrap_or(account);
                    (account, meta)
                })
                .collect();

            prepared.push(Prepared {
                transaction: ExpandedTransaction {
                    transaction: Transaction {
                        id: cursor.take_id(),
                        postings,
                        reference: script.reference().map(str::to_string),
                        metadata,
                        timestamp,
                    },
                    pre_commit_volumes: volumes.pre_commit,
                    post_commit_volumes: volumes.post_commit,
                },
                account_metadata,
            });
        }
        Ok(prepared)
    }

    /// Checks raw transaction data against the ledger's contracts without writing anything.
    pub async fn prepare_txs_data(&self, txs_data: &[TransactionData]) -> Result<Vec<Prepared>> {
        if txs_data.is_empty() {
            return Err(LedgerError::validation("no transaction data to execute"));
        }

        let last = self.last_transaction().await?;
        let mut contracts: Vec<Contract> = self
            .store
            .load_mapping()
            .await
            .map_err(|e| LedgerError::storage("loading mapping", e))?
            .map(|mapping| mapping.contracts)
            .unwrap_or_default();
        contracts.extend(default_contracts());

        let mut cursor = BatchCursor::new(last.as_ref(), self.config.allow_past_timestamps);
        let mut accounts = AccountCache::new(self.store.as_ref());
        let mut aggregator = VolumeAggregator::new(self.store.as_ref());
        let mut prepared = Vec::with_capacity(txs_data.len());

        for (i, data) in txs_data.iter().enumerate() {
            data.postings
                .validate()
                .map_err(|e| LedgerError::validation(format!("executing transaction data {}: {}", i, e)))?;
            let postings = data.postings.clone().without_zero();
            if postings.is_empty() {
                return Err(LedgerError::validation(format!(
                    "executing transaction data {}: no postings",
                    i
                )));
            }
            let timestamp = cursor.timestamp(data.timestamp)?;
            self.check_reference(&mut cursor, data.reference()).await?;

            aggregator.next_tx();
            for posting in &postings {
                aggregator
                    .transfer(&posting.source, &posting.destination, &posting.asset, &posting.amount)
                    .await?;
            }
            let volumes = aggregator
                .current()
                .cloned()
                .ok_or_else(|| LedgerError::Internal("missing transaction volumes".to_string()))?;
            accounts.apply(&volumes.post_commit).await?;

            for (address, assets) in volumes.post_commit.iter() {
                if address == WORLD {
                    continue;
                }
                let account_metadata = accounts.account(address).await?.metadata.clone();
                let Some(contract) = contracts.iter().find(|c| c.matches(address)) else {
                    continue;
                };
                for (asset, volume) in assets {
                    let ctx = EvalContext::for_balance(volume.balance().into_bigint(), account_metadata.clone());
                    let accepted = contract.expr.eval(&ctx).map_err(|e| {
                        LedgerError::validation(format!("evaluating contract {:?}: {}", contract.id, e))
                    })?;
                    if !accepted {
                        return Err(LedgerError::InsufficientFund { asset: asset.clone() });
                    }
                }
            }

            prepared.push(Prepared {
                transaction: ExpandedTransaction {
                    transaction: Transaction {
                        id: cursor.take_id(),
                        postings,
                        reference: data.reference().map(str::to_string),
                        metadata: data.metadata.clone(),
                        timestamp,
                    },
                    pre_commit_volumes: volumes.pre_commit,
                    post_commit_volumes: volumes.post_commit,
                },
                account_metadata: BTreeMap::new(),
            });
        }
        Ok(prepared)
    }

    /// Writes prepared transactions and the account metadata they set to the store in one
    /// commit.
    pub async fn commit(&self, prepared: &[Prepared]) -> Result<()> {
        let transactions: Vec<ExpandedTransaction> = prepared.iter().map(|p| p.transaction.clone()).collect();
        let account_metadata: Vec<(String, Metadata)> = prepared
            .iter()
            .flat_map(|p| p.account_metadata.iter())
            .map(|(address, metadata)| (address.clone(), metadata.clone()))
            .collect();
        self.store
            .commit(&transactions, &account_metadata)
            .await
            .map_err(|e| {
                if e.is_constraint_failed() {
                    let reference = transactions
                        .iter()
                        .find_map(|tx| tx.transaction.reference())
                        .unwrap_or_default()
                        .to_string();
                    LedgerError::Conflict { reference }
                } else {
                    LedgerError::storage("committing transactions", e)
                }
            })
    }

    /// Queues logs on the write-back task.
    pub fn enqueue(&self, logs: Vec<Log>, idempotency_key: Option<&str>) -> LogHandle {
        let logs = logs
            .into_iter()
            .map(|log| log.with_idempotency_key(idempotency_key.map(str::to_string)))
            .collect();
        self.writer.append(logs)
    }

    /// Commits and queues `prepared` unless previewing.
    pub async fn finish(
        &self,
        prepared: Vec<Prepared>,
        mode: ExecutionMode,
        idempotency_key: Option<&str>,
    ) -> Result<Pending<Vec<Prepared>>> {
        if mode == ExecutionMode::Preview {
            return Ok(Pending::preview(prepared));
        }
        self.commit(&prepared).await?;

        let logs = prepared
            .iter()
            .map(|p| Log::new_transaction(p.transaction.transaction.clone(), p.account_metadata.clone()))
            .collect();
        let handle = self.enqueue(logs, idempotency_key);
        Ok(Pending::new(prepared, handle))
    }

    pub async fn execute_scripts(
        &self,
        scripts: &[ScriptData],
        mode: ExecutionMode,
        idempotency_key: Option<&str>,
    ) -> Result<Pending<Vec<Prepared>>> {
        let prepared = self.prepare_scripts(scripts).await?;
        self.finish(prepared, mode, idempotency_key).await
    }

    pub async fn execute_txs_data(
        &self,
        txs_data: &[TransactionData],
        mode: ExecutionMode,
        idempotency_key: Option<&str>,
    ) -> Result<Pending<Vec<Prepared>>> {
        let prepared = self.prepare_txs_data(txs_data).await?;
        self.finish(prepared, mode, idempotency_key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contract::{Expr, Mapping};
    use crate::core::log::PersistedLog;
    use crate::core::store::{Cursor, MemoryStore, StorageError};
    use crate::core::transaction::Posting;
    use crate::core::volumes::Volumes;
    use crate::machine::program::{JsonCompiler, Program, ProgramBuilder};
    use crate::machine::value::{Monetary, Type, Value};
    use assert_matches::assert_matches;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn executor(store: Arc<MemoryStore>, config: LedgerConfig) -> Executor {
        let (writer, _task) = LogWriter::spawn(store.clone(), 16, Vec::new());
        Executor::new(store, Arc::new(JsonCompiler), writer, config)
    }

    fn send(source: &str, destination: &str, asset: &str, amount: u64) -> String {
        let mut builder = ProgramBuilder::new();
        builder.send(source, destination, Monetary::new(Asset::parse(asset).unwrap(), amount));
        serde_json::to_string(&builder.build()).unwrap()
    }

    fn source(program: Program) -> String {
        serde_json::to_string(&program).unwrap()
    }

    #[tokio::test]
    async fn test_script_batch_sees_earlier_items() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store.clone(), LedgerConfig::default());

        let scripts = vec![
            ScriptData::new(send("world", "users:001", "USD", 100)),
            ScriptData::new(send("users:001", "users:002", "USD", 60)),
        ];
        let txs = executor
            .execute_scripts(&scripts, ExecutionMode::Commit, None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(txs.iter().map(|p| p.transaction.id()).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(
            txs[1].transaction.pre_commit_volumes.get_volumes("users:001", "USD"),
            Volumes::new(100u64, 0u64)
        );
        assert_eq!(
            store.get_account("users:001").await.unwrap().balance("USD"),
            MonetaryInt::from(40u64)
        );
        assert_eq!(store.logs().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_preview_writes_nothing() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store.clone(), LedgerConfig::default());
        let pending = executor
            .execute_scripts(
                &[ScriptData::new(send("world", "users:001", "USD", 100))],
                ExecutionMode::Preview,
                None,
            )
            .await
            .unwrap();
        assert!(pending.handle.is_empty());
        assert_eq!(pending.value[0].transaction.id(), 0);
        assert_eq!(store.count_transactions().await.unwrap(), 0);
        assert!(store.logs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_inputs() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store, LedgerConfig::default());
        let err = executor.prepare_scripts(&[]).await.unwrap_err();
        assert_eq!(err.script_code(), Some(ScriptErrorCode::NoScript));
        let err = executor.prepare_scripts(&[ScriptData::new("")]).await.unwrap_err();
        assert_eq!(err.script_code(), Some(ScriptErrorCode::NoScript));
        assert_matches!(executor.prepare_txs_data(&[]).await, Err(LedgerError::Validation(_)));

        let err = executor
            .prepare_txs_data(&[TransactionData::new(vec![])])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "executing transaction data 0: no postings");
    }

    #[tokio::test]
    async fn test_invalid_variables_are_compilation_failures() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store, LedgerConfig::default());
        let mut builder = ProgramBuilder::new();
        builder.variable("dest", Type::Account);
        let script = ScriptData::new(source(builder.build()));
        let err = executor.prepare_scripts(&[script]).await.unwrap_err();
        assert_eq!(err.script_code(), Some(ScriptErrorCode::CompilationFailed));
        assert!(err.to_string().contains("could not set variables"));
    }

    #[tokio::test]
    async fn test_fail_instruction() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store, LedgerConfig::default());
        let mut builder = ProgramBuilder::new();
        builder.op(crate::machine::program::Opcode::Fail);
        let err = executor
            .prepare_scripts(&[ScriptData::new(source(builder.build()))])
            .await
            .unwrap_err();
        assert_matches!(err, LedgerError::ScriptFailed(msg) if msg == "script exited with error code EXIT_FAIL");
    }

    #[tokio::test]
    async fn test_account_metadata_from_script() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store.clone(), LedgerConfig::default());
        let mut builder = ProgramBuilder::new();
        builder
            .send("world", "users:001", Monetary::new(Asset::parse("USD").unwrap(), 1u64))
            .account_meta("users:001", "tier", Value::String("gold".into()));
        executor
            .execute_scripts(&[ScriptData::new(source(builder.build()))], ExecutionMode::Commit, None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        let account = store.get_account("users:001").await.unwrap();
        assert_eq!(account.metadata["tier"], json!({"type": "string", "value": "gold"}));
    }

    #[tokio::test]
    async fn test_timestamps_within_batch_must_not_go_back() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store, LedgerConfig::default());
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let data = |ts| TransactionData::new(vec![Posting::new("world", "a", 1u64, "USD")]).with_timestamp(ts);

        let err = executor
            .prepare_txs_data(&[data(t0), data(t0 - Duration::seconds(1))])
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot pass a timestamp prior to the last transaction: 2024-01-01T11:59:59Z (passed) is 1s before 2024-01-01T12:00:00Z (last)"
        );
    }

    #[tokio::test]
    async fn test_contracts_from_mapping() {
        let store = Arc::new(MemoryStore::new("default"));
        store
            .save_mapping(Mapping {
                contracts: vec![Contract {
                    id: "credit".into(),
                    account: "credit:*".into(),
                    expr: Expr::parse(&json!({"$gte": ["$balance", -50]})).unwrap(),
                }],
            })
            .await
            .unwrap();
        let executor = executor(store, LedgerConfig::default());

        let overdraft = |account: &str, amount: u64| {
            TransactionData::new(vec![Posting::new(account, "world", amount, "USD")])
        };
        assert!(executor.prepare_txs_data(&[overdraft("credit:001", 50)]).await.is_ok());
        assert_matches!(
            executor.prepare_txs_data(&[overdraft("credit:001", 51)]).await,
            Err(LedgerError::InsufficientFund { asset }) if asset == "USD"
        );
        assert_matches!(
            executor.prepare_txs_data(&[overdraft("users:001", 1)]).await,
            Err(LedgerError::InsufficientFund { .. })
        );
    }

    #[tokio::test]
    async fn test_invalid_posting_is_rejected() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store, LedgerConfig::default());
        let err = executor
            .prepare_txs_data(&[TransactionData::new(vec![Posting::new("world", "bad account", 1u64, "USD")])])
            .await
            .unwrap_err();
        assert_matches!(err, LedgerError::Validation(msg) if msg.contains("invalid destination"));
    }

    #[tokio::test]
    async fn test_account_cache_applies_batch_volumes() {
        let store = MemoryStore::new("default");
        let mut cache = AccountCache::new(&store);
        let mut volumes = AccountsAssetsVolumes::new();
        volumes.set_volumes("a", "USD", Volumes::new(10u64, 3u64));
        cache.apply(&volumes).await.unwrap();
        let balance = cache
            .account_balance("a", &Asset::parse("USD").unwrap())
            .await
            .unwrap();
        assert_eq!(balance, MonetaryInt::from(7u64));
    }

    #[tokio::test]
    async fn test_zero_postings_are_dropped() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store.clone(), LedgerConfig::default());

        let err = executor
            .prepare_txs_data(&[TransactionData::new(vec![Posting::new("world", "a", 0u64, "USD")])])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "executing transaction data 0: no postings");

        let prepared = executor
            .prepare_txs_data(&[TransactionData::new(vec![
                Posting::new("world", "b", 0u64, "USD"),
                Posting::new("world", "c", 5u64, "USD"),
            ])])
            .await
            .unwrap();
        let postings = &prepared[0].transaction.transaction.postings;
        assert_eq!(postings.len(), 1);
        assert_eq!(postings.0[0].destination, "c");
        assert!(prepared[0].transaction.post_commit_volumes.account("b").is_none());

        executor.commit(&prepared).await.unwrap();
        assert_eq!(store.count_accounts().await.unwrap(), 2);
        assert_eq!(store.get_account("c").await.unwrap().balance("USD"), MonetaryInt::from(5u64));
    }

    #[tokio::test]
    async fn test_commit_writes_account_metadata_with_transactions() {
        let store = Arc::new(MemoryStore::new("default"));
        let executor = executor(store.clone(), LedgerConfig::default());
        let mut builder = ProgramBuilder::new();
        builder
            .send("world", "users:001", Monetary::new(Asset::parse("USD").unwrap(), 1u64))
            .account_meta("users:002", "tier", Value::String("gold".into()));
        let prepared = executor
            .prepare_scripts(&[ScriptData::new(source(builder.build()))])
            .await
            .unwrap();
        assert!(store.get_account("users:002").await.unwrap().metadata.is_empty());

        executor.commit(&prepared).await.unwrap();
        assert_eq!(store.count_transactions().await.unwrap(), 1);
        let account = store.get_account("users:002").await.unwrap();
        assert_eq!(account.metadata["tier"], json!({"type": "string", "value": "gold"}));
    }

    /// Store whose commits always hit a uniqueness constraint.
    struct ConstraintFailingStore(MemoryStore);

    #[async_trait]
    impl Store for ConstraintFailingStore {
        fn name(&self) -> &str {
            self.0.name()
        }

        async fn get_last_transaction(&self) -> std::result::Result<Option<Transaction>, StorageError> {
            self.0.get_last_transaction().await
        }

        async fn get_transaction(&self, id: u64) -> std::result::Result<Option<ExpandedTransaction>, StorageError> {
            self.0.get_transaction(id).await
        }

        async fn get_transactions(
            &self,
            query: &TransactionsQuery,
        ) -> std::result::Result<Cursor<ExpandedTransaction>, StorageError> {
            self.0.get_transactions(query).await
        }

        async fn count_transactions(&self) -> std::result::Result<u64, StorageError> {
            self.0.count_transactions().await
        }

        async fn get_account(&self, address: &str) -> std::result::Result<AccountWithVolumes, StorageError> {
            self.0.get_account(address).await
        }

        async fn get_volumes(&self, account: &str, asset: &str) -> std::result::Result<Volumes, StorageError> {
            self.0.get_volumes(account, asset).await
        }

        async fn count_accounts(&self) -> std::result::Result<u64, StorageError> {
            self.0.count_accounts().await
        }

        async fn load_mapping(&self) -> std::result::Result<Option<Mapping>, StorageError> {
            self.0.load_mapping().await
        }

        async fn save_mapping(&self, mapping: Mapping) -> std::result::Result<(), StorageError> {
            self.0.save_mapping(mapping).await
        }

        async fn commit(
            &self,
            _transactions: &[ExpandedTransaction],
            _account_metadata: &[(String, Metadata)],
        ) -> std::result::Result<(), StorageError> {
            Err(StorageError::ConstraintFailed("duplicate reference".into()))
        }

        async fn update_transaction_metadata(
            &self,
            id: u64,
            metadata: Metadata,
        ) -> std::result::Result<(), StorageError> {
            self.0.update_transaction_metadata(id, metadata).await
        }

        async fn update_account_metadata(
            &self,
            address: &str,
            metadata: Metadata,
        ) -> std::result::Result<(), StorageError> {
            self.0.update_account_metadata(address, metadata).await
        }

        async fn last_log(&self) -> std::result::Result<Option<PersistedLog>, StorageError> {
            self.0.last_log().await
        }

        async fn append_logs(&self, logs: &[PersistedLog]) -> std::result::Result<(), StorageError> {
            self.0.append_logs(logs).await
        }

        async fn logs(&self) -> std::result::Result<Vec<PersistedLog>, StorageError> {
            self.0.logs().await
        }
    }

    #[tokio::test]
    async fn test_constraint_failure_on_commit_is_a_conflict() {
        let store = Arc::new(ConstraintFailingStore(MemoryStore::new("default")));
        let (writer, _task) = LogWriter::spawn(store.clone(), 16, Vec::new());
        let executor = Executor::new(store, Arc::new(JsonCompiler), writer, LedgerConfig::default());

        let prepared = executor
            .prepare_txs_data(&[
                TransactionData::new(vec![Posting::new("world", "a", 1u64, "USD")]).with_reference("r1")
            ])
            .await
            .unwrap();
        let err = executor.commit(&prepared).await.unwrap_err();
        assert_matches!(err, LedgerError::Conflict { ref reference } if reference == "r1");
        assert_eq!(err.code(), "CONFLICT");
    }
}
