use std::fmt;

use thiserror::Error;

/// Sub-kind of a [`ScriptError`]. Each kind maps to a stable code string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptErrorCode {
    NoScript,
    CompilationFailed,
    InsufficientFund,
    MetadataOverride,
}

impl ScriptErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptErrorCode::NoScript => "NO_SCRIPT",
            ScriptErrorCode::CompilationFailed => "COMPILATION_FAILED",
            ScriptErrorCode::InsufficientFund => "INSUFFICIENT_FUND",
            ScriptErrorCode::MetadataOverride => "METADATA_OVERRIDE",
        }
    }
}

impl fmt::Display for ScriptErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user or script-authoring error. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ScriptError {
    pub code: ScriptErrorCode,
    pub message: String,
}

impl ScriptError {
    pub fn new(code: ScriptErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("{0}")]
    Validation(String),

    #[error("conflict error on reference")]
    Conflict { reference: String },

    #[error("balance.insufficient.{asset}")]
    InsufficientFund { asset: String },

    #[error("lock error: {0}")]
    Lock(#[from] crate::core::locker::LockError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transaction {0} already reverted")]
    AlreadyReverted(u64),

    #[error("{0}")]
    ScriptFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: crate::core::store::StorageError,
    },

    #[error("writing logs: {0}")]
    LogWrite(String),
}

impl LedgerError {
    /// Wraps a storage failure with the operation it interrupted.
    pub fn storage(context: impl Into<String>, source: crate::core::store::StorageError) -> Self {
        LedgerError::Storage {
            context: context.into(),
            source,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    /// Stable machine-readable code for API boundaries.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::Script(err) => err.code.as_str(),
            LedgerError::Validation(_) => "VALIDATION",
            LedgerError::Conflict { .. } => "CONFLICT",
            LedgerError::InsufficientFund { .. } => "INSUFFICIENT_FUND",
            LedgerError::Lock(_) => "LOCK",
            LedgerError::NotFound(_) => "NOT_FOUND",
            LedgerError::AlreadyReverted(_) => "ALREADY_REVERTED",
            LedgerError::ScriptFailed(_) => "SCRIPT_FAILED",
            LedgerError::Internal(_) => "INTERNAL",
            LedgerError::Storage { .. } => "STORAGE",
            LedgerError::LogWrite(_) => "INTERNAL",
        }
    }

    /// Returns the script error kind, if any.
    pub fn script_code(&self) -> Option<ScriptErrorCode> {
        match self {
            LedgerError::Script(err) => Some(err.code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
