//! Ledger core: the data model, storage seam, executor and the facade tying them together.
//!
//! Execution flow of a mutating call:
//!
//! 1. [`ledger::Ledger`] takes the per-ledger lock from a [`locker::Locker`].
//! 2. [`executor::Executor`] runs scripts (or raw postings) against a per-batch account cache,
//!    checks contracts, references and timestamps, and aggregates volumes.
//! 3. The batch is committed to the [`store::Store`] in one call.
//! 4. Logs are queued on the [`pipeline::LogWriter`]; the caller gets a [`pipeline::Pending`]
//!    that resolves once they are durable.
//!
//! # Invariants
//!
//! - Transaction ids are contiguous and strictly increasing per ledger.
//! - A reference is used by at most one transaction per ledger.
//! - Volumes only grow; balances are `input - output`.
//! - A failed batch leaves store, volumes and log chain untouched.

pub mod account;
pub mod aggregator;
pub mod asset;
pub mod cache;
pub mod contract;
pub mod executor;
pub mod ledger;
pub mod locker;
pub mod log;
pub mod metadata;
pub mod monitor;
pub mod pipeline;
pub mod store;
pub mod transaction;
pub mod volumes;

pub use account::{AccountWithVolumes, WORLD};
pub use asset::Asset;
pub use ledger::{Ledger, LedgerBuilder, Stats, WriteOptions};
pub use metadata::Metadata;
pub use transaction::{ExpandedTransaction, Posting, Postings, ScriptData, Transaction, TransactionData};
