//! Hash-chained, append-only ledger logs.
//!
//! # Invariants
//!
//! - Persisted log ids start at 0 and increase by one with no gaps.
//! - `hash` of log `i` is SHA-256 over the hash of log `i - 1` (nothing for the first log)
//!   followed by the canonical JSON of log `i`'s id, type, payload, date and idempotency key.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::metadata::Metadata;
use crate::core::transaction::Transaction;
use crate::error::{LedgerError, Result};
use crate::utils::{hash_chained, LOG_HASH_DOMAIN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    SetMetadata,
    NewTransaction,
    RevertedTransaction,
}

/// What a metadata update targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Account,
    Transaction,
}

impl FromStr for TargetType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(LedgerError::validation("empty target type")),
            "account" | "ACCOUNT" => Ok(TargetType::Account),
            "transaction" | "TRANSACTION" => Ok(TargetType::Transaction),
            other => Err(LedgerError::validation(format!("unknown target type '{}'", other))),
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TargetType::Account => "account",
            TargetType::Transaction => "transaction",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogPayload {
    SetMetadata {
        target_type: TargetType,
        target_id: String,
        metadata: Metadata,
    },
    NewTransaction {
        transaction: Transaction,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        account_metadata: BTreeMap<String, Metadata>,
    },
    RevertedTransaction {
        reverted_transaction_id: u64,
        transaction: Transaction,
    },
}

/// A log waiting for an id and a hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Log {
    pub data: LogPayload,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Log {
    pub fn new(data: LogPayload, date: DateTime<Utc>) -> Self {
        Self {
            data,
            date,
            idempotency_key: None,
        }
    }

    pub fn new_transaction(transaction: Transaction, account_metadata: BTreeMap<String, Metadata>) -> Self {
        let date = transaction.timestamp;
        Self::new(
            LogPayload::NewTransaction {
                transaction,
                account_metadata,
            },
            date,
        )
    }

    pub fn set_metadata(target_type: TargetType, target_id: impl Into<String>, metadata: Metadata, date: DateTime<Utc>) -> Self {
        Self::new(
            LogPayload::SetMetadata {
                target_type,
                target_id: target_id.into(),
                metadata,
            },
            date,
        )
    }

    pub fn reverted_transaction(reverted_transaction_id: u64, transaction: Transaction) -> Self {
        let date = transaction.timestamp;
        Self::new(
            LogPayload::RevertedTransaction {
                reverted_transaction_id,
                transaction,
            },
            date,
        )
    }

    pub fn with_idempotency_key(mut self, key: Option<String>) -> Self {
        self.idempotency_key = key.filter(|k| !k.is_empty());
        self
    }

    pub fn log_type(&self) -> LogType {
        match self.data {
            LogPayload::SetMetadata { .. } => LogType::SetMetadata,
            LogPayload::NewTransaction { .. } => LogType::NewTransaction,
            LogPayload::RevertedTransaction { .. } => LogType::RevertedTransaction,
        }
    }

    /// Appends this log after `previous`, assigning its id and hash.
    pub fn chain(self, previous: Option<&PersistedLog>) -> Result<PersistedLog> {
        let id = previous.map_or(0, |p| p.id + 1);
        let hash = compute_hash(id, &self, previous.map(|p| p.hash.as_str()))?;
        Ok(PersistedLog { id, log: self, hash })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HashedLog<'a> {
    id: u64,
    #[serde(rename = "type")]
    log_type: LogType,
    data: &'a LogPayload,
    date: &'a DateTime<Utc>,
    idempotency_key: &'a Option<String>,
}

fn compute_hash(id: u64, log: &Log, previous_hash: Option<&str>) -> Result<String> {
    let hashed = HashedLog {
        id,
        log_type: log.log_type(),
        data: &log.data,
        date: &log.date,
        idempotency_key: &log.idempotency_key,
    };
    hash_chained(LOG_HASH_DOMAIN, previous_hash, &hashed)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedLog {
    pub id: u64,
    #[serde(flatten)]
    pub log: Log,
    pub hash: String,
}

impl PersistedLog {
    pub fn log_type(&self) -> LogType {
        self.log.log_type()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogChainError {
    #[error("log {expected} missing, found log {found}")]
    Gap { expected: u64, found: u64 },

    #[error("invalid hash for log {0}")]
    InvalidHash(u64),

    #[error("hashing log {id}: {reason}")]
    Hashing { id: u64, reason: String },
}

/// Recomputes the chain and reports the first inconsistent log.
pub fn verify_chain(logs: &[PersistedLog]) -> std::result::Result<(), LogChainError> {
    let mut previous: Option<&PersistedLog> = None;
    for log in logs {
        let expected = previous.map_or(0, |p| p.id + 1);
        if log.id != expected {
            return Err(LogChainError::Gap {
                expected,
                found: log.id,
            });
        }
        let hash = compute_hash(log.id, &log.log, previous.map(|p| p.hash.as_str())).map_err(|e| {
            LogChainError::Hashing {
                id: log.id,
                reason: e.to_string(),
            }
        })?;
        if hash != log.hash {
            return Err(LogChainError::InvalidHash(log.id));
        }
        previous = Some(log);
    }
    Ok(())
}
