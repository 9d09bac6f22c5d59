//! Per-ledger mutual exclusion for mutating calls.
//!
//! One mutex per ledger name, created on first use and kept for the lifetime of the
//! locker. Guards are owned so they can be held across `.await` points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("locker is closed")]
    Closed,

    #[error("cannot lock ledger {ledger}: {reason}")]
    Unavailable { ledger: String, reason: String },
}

/// Held while a ledger is locked. Dropping it releases the ledger.
pub type LedgerGuard = OwnedMutexGuard<()>;

#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self, ledger: &str) -> Result<LedgerGuard, LockError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLocker {
    locks: DashMap<String, Arc<Mutex<()>>>,
    closed: AtomicBool,
}

impl InMemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses every later `lock`. Guards already handed out stay valid.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Number of ledgers seen so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn lock(&self, ledger: &str) -> Result<LedgerGuard, LockError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LockError::Closed);
        }
        let mutex = self
            .locks
            .entry(ledger.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Ok(mutex.lock_owned().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_ledger_is_exclusive() {
        let locker = Arc::new(InMemoryLocker::new());
        let guard = locker.lock("quickstart").await.unwrap();

        let contender = {
            let locker = Arc::clone(&locker);
            tokio::spawn(async move { locker.lock("quickstart").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_different_ledgers_do_not_block() {
        let locker = InMemoryLocker::new();
        let _a = locker.lock("a").await.unwrap();
        let _b = locker.lock("b").await.unwrap();
        assert_eq!(locker.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_locker_refuses() {
        let locker = InMemoryLocker::new();
        locker.close();
        assert_eq!(locker.lock("a").await.unwrap_err(), LockError::Closed);
    }
}
