pub mod config;
pub mod core;
pub mod error;
pub mod machine;
pub mod utils;

pub use config::LedgerConfig;
pub use error::{LedgerError, Result, ScriptError, ScriptErrorCode};

// Core API exports
pub use crate::core::{Ledger, LedgerBuilder, Stats, WriteOptions};
pub use crate::core::account::{is_valid_address, AccountWithVolumes, WORLD};
pub use crate::core::aggregator::{TxVolumes, VolumeAggregator};
pub use crate::core::asset::{is_valid_asset, Asset, InvalidAsset};
pub use crate::core::cache::ProgramCache;
pub use crate::core::contract::{default_contracts, Comparison, Contract, ContractError, EvalContext, Expr, Mapping, Operand};
pub use crate::core::executor::{ExecutionMode, Executor, Prepared};
pub use crate::core::locker::{InMemoryLocker, LedgerGuard, LockError, Locker};
pub use crate::core::log::{verify_chain, Log, LogChainError, LogPayload, LogType, PersistedLog, TargetType};
pub use crate::core::metadata::Metadata;
pub use crate::core::monitor::{Monitor, NoOpMonitor};
pub use crate::core::pipeline::{LogHandle, LogListener, LogWriter, Pending};
pub use crate::core::store::{Cursor, MemoryStore, StorageError, Store, TransactionsQuery, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use crate::core::transaction::{
    ExpandedTransaction,
    Posting,
    PostingValidationError,
    Postings,
    ScriptData,
    Transaction,
    TransactionData,
};
pub use crate::core::volumes::{AccountsAssetsVolumes, AssetsBalances, AssetsVolumes, Volumes};

// Virtual machine exports
pub use machine::{
    Allotment,
    CompileError,
    Compiler,
    ExitCode,
    Funding,
    FundingPart,
    JsonCompiler,
    Machine,
    MachineError,
    Monetary,
    MonetaryInt,
    Opcode,
    Portion,
    Program,
    ProgramBuilder,
    Resource,
    ResourceResolver,
    Type,
    Value,
};
