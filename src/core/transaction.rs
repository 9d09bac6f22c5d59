//! Postings and transactions.
//!
//! A posting moves a non-negative amount of one asset between two accounts. A committed
//! transaction carries at least one non-zero posting, an id assigned at commit time and a
//! UTC timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::account::is_valid_address;
use crate::core::asset::is_valid_asset;
use crate::core::metadata::{self, Metadata};
use crate::core::volumes::AccountsAssetsVolumes;
use crate::error::LedgerError;
use crate::machine::monetary::MonetaryInt;

/// Errors produced by posting validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PostingValidationError {
    #[error("posting {0}: negative amount")]
    NegativeAmount(usize),

    #[error("posting {0}: invalid source address")]
    InvalidSource(usize),

    #[error("posting {0}: invalid destination address")]
    InvalidDestination(usize),

    #[error("posting {0}: invalid asset")]
    InvalidAsset(usize),
}

impl From<PostingValidationError> for LedgerError {
    fn from(err: PostingValidationError) -> Self {
        LedgerError::Validation(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub source: String,
    pub destination: String,
    pub amount: MonetaryInt,
    pub asset: String,
}

impl Posting {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        amount: impl Into<MonetaryInt>,
        asset: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            amount: amount.into(),
            asset: asset.into(),
        }
    }

    fn validate(&self, index: usize) -> Result<(), PostingValidationError> {
        if self.amount.is_negative() {
            return Err(PostingValidationError::NegativeAmount(index));
        }
        if !is_valid_address(&self.source) {
            return Err(PostingValidationError::InvalidSource(index));
        }
        if !is_valid_address(&self.destination) {
            return Err(PostingValidationError::InvalidDestination(index));
        }
        if !is_valid_asset(&self.asset) {
            return Err(PostingValidationError::InvalidAsset(index));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Postings(pub Vec<Posting>);

impl Postings {
    /// Postings undoing these ones: order reversed, source and destination swapped.
    pub fn reverse(&self) -> Postings {
        Postings(
            self.0
                .iter()
                .rev()
                .map(|p| Posting::new(p.destination.clone(), p.source.clone(), p.amount.clone(), p.asset.clone()))
                .collect(),
        )
    }

    pub fn validate(&self) -> Result<(), PostingValidationError> {
        self.0.iter().enumerate().try_for_each(|(i, p)| p.validate(i))
    }

    /// Drops zero-amount postings.
    pub fn without_zero(self) -> Postings {
        Postings(self.0.into_iter().filter(|p| !p.amount.is_zero()).collect())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Posting> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Posting>> for Postings {
    fn from(postings: Vec<Posting>) -> Self {
        Postings(postings)
    }
}

impl<'a> IntoIterator for &'a Postings {
    type Item = &'a Posting;
    type IntoIter = std::slice::Iter<'a, Posting>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

fn is_none_or_empty(reference: &Option<String>) -> bool {
    reference.as_deref().map_or(true, str::is_empty)
}

/// Caller supplied transaction content, before an id and timestamp are assigned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionData {
    pub postings: Postings,
    #[serde(default, skip_serializing_if = "is_none_or_empty")]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl TransactionData {
    pub fn new(postings: Vec<Posting>) -> Self {
        Self {
            postings: Postings(postings),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The reference, if set and non-empty.
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref().filter(|r| !r.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub postings: Postings,
    #[serde(default, skip_serializing_if = "is_none_or_empty")]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub timestamp: DateTime<Utc>,
}

impl Transaction {
    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref().filter(|r| !r.is_empty())
    }

    pub fn is_reverted(&self) -> bool {
        metadata::is_reverted(&self.metadata)
    }

    /// Transaction data undoing this transaction, marked as its revert.
    pub fn reverse(&self) -> TransactionData {
        let mut metadata = Metadata::new();
        metadata::mark_reverts(&mut metadata, self.id);
        TransactionData {
            postings: self.postings.reverse(),
            reference: None,
            metadata,
            timestamp: None,
        }
    }
}

/// A transaction with the volumes of every touched (account, asset) pair right before and
/// right after it, at its position in the commit batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpandedTransaction {
    #[serde(flatten)]
    pub transaction: Transaction,
    pub pre_commit_volumes: AccountsAssetsVolumes,
    pub post_commit_volumes: AccountsAssetsVolumes,
}

impl ExpandedTransaction {
    pub fn id(&self) -> u64 {
        self.transaction.id
    }
}

/// A script execution request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptData {
    pub plain: String,
    #[serde(default)]
    pub vars: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "is_none_or_empty")]
    pub reference: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ScriptData {
    pub fn new(plain: impl Into<String>) -> Self {
        Self {
            plain: plain.into(),
            ..Default::default()
        }
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref().filter(|r| !r.is_empty())
    }
}
