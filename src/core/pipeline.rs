//! Batched write-back of ledger logs.
//!
//! A single task owns the chain head. Producers hand it logs through a channel and get a
//! [`LogHandle`] back; the task drains everything pending, assigns ids and hashes, persists
//! the batch in one [`Store::append_logs`] call, then resolves every handle of the batch.
//!
//! # Invariants
//!
//! - Log ids are assigned and persisted in strictly increasing order.
//! - Listeners see each persisted batch exactly once, after the store accepted it.
//! - `stop` returns only after every log submitted before it has been written.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::core::log::{Log, PersistedLog};
use crate::core::store::Store;
use crate::error::{LedgerError, Result};

/// Called with every persisted batch.
pub trait LogListener: Send + Sync {
    fn on_logs_written(&self, logs: &[PersistedLog]);
}

type Reply = oneshot::Sender<Result<Vec<PersistedLog>>>;

struct AppendRequest {
    logs: Vec<Log>,
    reply: Reply,
}

enum Command {
    Append(AppendRequest),
    Stop(oneshot::Sender<()>),
}

/// Resolves once the logs of one call are durably written.
#[must_use = "dropping the handle does not cancel the write"]
pub struct LogHandle {
    receiver: Option<oneshot::Receiver<Result<Vec<PersistedLog>>>>,
}

impl LogHandle {
    /// A handle with nothing to wait for.
    pub fn empty() -> Self {
        Self { receiver: None }
    }

    fn failed(err: LedgerError) -> Self {
        let (reply, receiver) = oneshot::channel();
        let _ = reply.send(Err(err));
        Self {
            receiver: Some(receiver),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_none()
    }

    /// Waits for the write. Dropping the future instead of awaiting it does not undo it.
    pub async fn wait(self) -> Result<Vec<PersistedLog>> {
        match self.receiver {
            None => Ok(Vec::new()),
            Some(receiver) => receiver
                .await
                .map_err(|_| LedgerError::LogWrite("log writer stopped before writing".to_string()))?,
        }
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle").field("empty", &self.is_empty()).finish()
    }
}

/// The result of a write together with the handle of its logs.
#[must_use = "call `wait` to observe durability, or `into_parts` to detach"]
#[derive(Debug)]
pub struct Pending<T> {
    pub value: T,
    pub handle: LogHandle,
}

impl<T> Pending<T> {
    pub fn new(value: T, handle: LogHandle) -> Self {
        Self { value, handle }
    }

    /// A result that wrote nothing.
    pub fn preview(value: T) -> Self {
        Self::new(value, LogHandle::empty())
    }

    /// Waits until the logs are written, then returns the value.
    pub async fn wait(self) -> Result<T> {
        self.handle.wait().await?;
        Ok(self.value)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Pending<U> {
        Pending {
            value: f(self.value),
            handle: self.handle,
        }
    }

    pub fn into_parts(self) -> (T, LogHandle) {
        (self.value, self.handle)
    }
}

/// Producer side of the write-back task. Cheap to clone.
#[derive(Clone)]
pub struct LogWriter {
    commands: mpsc::UnboundedSender<Command>,
}

impl LogWriter {
    /// Spawns the write-back task on the current tokio runtime.
    pub fn spawn(store: Arc<dyn Store>, batch_size: usize, listeners: Vec<Arc<dyn LogListener>>) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::unbounded_channel();
        let task = WriteBack {
            store,
            batch_size: batch_size.max(1),
            listeners,
            head: None,
        };
        let handle = tokio::spawn(task.run(receiver));
        (Self { commands }, handle)
    }

    /// Queues logs for writing. Logs of one call are written contiguously.
    pub fn append(&self, logs: Vec<Log>) -> LogHandle {
        if logs.is_empty() {
            return LogHandle::empty();
        }
        let (reply, receiver) = oneshot::channel();
        let request = AppendRequest { logs, reply };
        match self.commands.send(Command::Append(request)) {
            Ok(()) => LogHandle {
                receiver: Some(receiver),
            },
            Err(_) => LogHandle::failed(LedgerError::LogWrite("log writer is stopped".to_string())),
        }
    }

    /// Flushes pending logs and stops the task. Stopping twice is a no-op.
    pub async fn stop(&self) {
        let (done, stopped) = oneshot::channel();
        if self.commands.send(Command::Stop(done)).is_ok() {
            let _ = stopped.await;
        }
    }
}

struct WriteBack {
    store: Arc<dyn Store>,
    batch_size: usize,
    listeners: Vec<Arc<dyn LogListener>>,
    head: Option<PersistedLog>,
}

impl WriteBack {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            let mut batch = Vec::new();
            let mut stop = None;
            match command {
                Command::Append(request) => batch.push(request),
                Command::Stop(done) => stop = Some(done),
            }

            let mut pending: usize = batch.iter().map(|r| r.logs.len()).sum();
            while stop.is_none() && pending < self.batch_size {
                match commands.try_recv() {
                    Ok(Command::Append(request)) => {
                        pending += request.logs.len();
                        batch.push(request);
                    }
                    Ok(Command::Stop(done)) => stop = Some(done),
                    Err(_) => break,
                }
            }
            if !batch.is_empty() {
                self.write(batch).await;
            }

            if let Some(done) = stop {
                commands.close();
                let mut rest = Vec::new();
                while let Ok(command) = commands.try_recv() {
                    match command {
                        Command::Append(request) => rest.push(request),
                        Command::Stop(other) => {
                            let _ = other.send(());
                        }
                    }
                }
                if !rest.is_empty() {
                    self.write(rest).await;
                }
                tracing::debug!("log writer stopped");
                let _ = done.send(());
                return;
            }
        }
    }

    async fn write(&mut self, batch: Vec<AppendRequest>) {
        match self.persist(&batch).await {
            Ok(persisted) => {
                let mut offset = 0;
                for request in batch {
                    let count = request.logs.len();
                    let _ = request.reply.send(Ok(persisted[offset..offset + count].to_vec()));
                    offset += count;
                }
                for listener in &self.listeners {
                    listener.on_logs_written(&persisted);
                }
            }
            Err(err) => {
                tracing::error!(error = %err, requests = batch.len(), "writing logs failed");
                // Reload the head from the store on the next batch.
                self.head = None;
                let message = err.to_string();
                for request in batch {
                    let _ = request.reply.send(Err(LedgerError::LogWrite(message.clone())));
                }
            }
        }
    }

    async fn persist(&mut self, batch: &[AppendRequest]) -> Result<Vec<PersistedLog>> {
        let mut previous = match self.head.take() {
            Some(head) => Some(head),
            None => self
                .store
                .last_log()
                .await
                .map_err(|e| LedgerError::storage("reading last log", e))?,
        };

        let mut persisted = Vec::with_capacity(batch.iter().map(|r| r.logs.len()).sum());
        for log in batch.iter().flat_map(|r| r.logs.iter()) {
            let chained = log.clone().chain(previous.as_ref())?;
            previous = Some(chained.clone());
            persisted.push(chained);
        }

        tracing::debug!(logs = persisted.len(), requests = batch.len(), "writing log batch");
        self.store
            .append_logs(&persisted)
            .await
            .map_err(|e| LedgerError::storage("appending logs", e))?;
        self.head = previous;
        Ok(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::log::{verify_chain, TargetType};
    use crate::core::metadata::Metadata;
    use crate::core::store::MemoryStore;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingListener {
        batches: Mutex<Vec<Vec<u64>>>,
    }

    impl LogListener for RecordingListener {
        fn on_logs_written(&self, logs: &[PersistedLog]) {
            self.batches.lock().unwrap().push(logs.iter().map(|l| l.id).collect());
        }
    }

    fn log(target: &str) -> Log {
        Log::set_metadata(TargetType::Account, target, Metadata::new(), Utc::now())
    }

    #[tokio::test]
    async fn test_logs_are_chained_in_order() {
        let store = Arc::new(MemoryStore::new("default"));
        let (writer, task) = LogWriter::spawn(store.clone(), 16, Vec::new());

        let first = writer.append(vec![log("a"), log("b")]);
        let second = writer.append(vec![log("c")]);
        let first = first.wait().await.unwrap();
        let second = second.wait().await.unwrap();

        assert_eq!(first.iter().map(|l| l.id).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(second[0].id, 2);
        assert_eq!(verify_chain(&store.logs().await.unwrap()), Ok(()));

        writer.stop().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_called_once_per_batch() {
        let store = Arc::new(MemoryStore::new("default"));
        let listener = Arc::new(RecordingListener::default());
        let (writer, _task) = LogWriter::spawn(store, 16, vec![listener.clone() as Arc<dyn LogListener>]);

        // Queued before the task gets to run, so they coalesce into one batch.
        let handles: Vec<_> = (0..3).map(|i| writer.append(vec![log(&format!("acc{}", i))])).collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }

        let batches = listener.batches.lock().unwrap().clone();
        assert_eq!(batches.iter().flatten().copied().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(batches.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_logs() {
        let store = Arc::new(MemoryStore::new("default"));
        let (writer, task) = LogWriter::spawn(store.clone(), 1, Vec::new());

        let handles: Vec<_> = (0..5).map(|i| writer.append(vec![log(&format!("acc{}", i))])).collect();
        writer.stop().await;
        task.await.unwrap();

        assert_eq!(store.logs().await.unwrap().len(), 5);
        for handle in handles {
            assert_eq!(handle.wait().await.unwrap().len(), 1);
        }

        let late = writer.append(vec![log("late")]);
        assert!(matches!(late.wait().await, Err(LedgerError::LogWrite(_))));
    }

    #[tokio::test]
    async fn test_chain_resumes_from_stored_head() {
        let store = Arc::new(MemoryStore::new("default"));
        let existing = log("seed").chain(None).unwrap();
        store.append_logs(&[existing]).await.unwrap();

        let (writer, _task) = LogWriter::spawn(store.clone(), 16, Vec::new());
        let written = writer.append(vec![log("next")]).wait().await.unwrap();
        assert_eq!(written[0].id, 1);
        assert_eq!(verify_chain(&store.logs().await.unwrap()), Ok(()));
    }

    #[tokio::test]
    async fn test_empty_handle_resolves_immediately() {
        let handle = LogHandle::empty();
        assert!(handle.is_empty());
        assert!(handle.wait().await.unwrap().is_empty());
    }
}
