//! Error types for the session store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Out of heap space: requested {requested} bytes, largest free block {largest_free} bytes")]
    OutOfSpace { requested: usize, largest_free: usize },

    #[error("Corrupt heap: {0}")]
    CorruptHeader(String),

    #[error("Corrupt transaction log: {0}")]
    CorruptLog(String),

    #[error("Invalid heap address: {0:#x}")]
    InvalidAddress(u64),

    #[error("Write to undeclared range at {offset:#x} (+{len})")]
    UnmarkedRange { offset: u64, len: usize },

    // Transaction discipline
    #[error("A transaction is already active")]
    AlreadyActiveTransaction,

    #[error("Transaction {0} is not the active transaction")]
    StaleTransaction(u64),

    // Session lifecycle
    #[error("A group session already exists")]
    AlreadyExists,

    #[error("No group session is loaded")]
    NoActiveSession,

    #[error("Payload of {len} bytes exceeds session capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Stable identifier used in log lines
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Io(_) => "IO_FAILURE",
            StoreError::OutOfSpace { .. } => "OUT_OF_SPACE",
            StoreError::CorruptHeader(_) => "CORRUPT_HEADER",
            StoreError::CorruptLog(_) => "CORRUPT_LOG",
            StoreError::AlreadyActiveTransaction => "ALREADY_ACTIVE_TRANSACTION",
            StoreError::StaleTransaction(_) => "STALE_TRANSACTION",
            StoreError::AlreadyExists => "ALREADY_EXISTS",
            StoreError::NoActiveSession => "NO_ACTIVE_SESSION",
            StoreError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            StoreError::Config(_) => "INVALID_CONFIG",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Transaction discipline violations indicate a bug in the caller.
    /// The offending connection is closed; the process keeps serving.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyActiveTransaction | StoreError::StaleTransaction(_)
        )
    }
}
