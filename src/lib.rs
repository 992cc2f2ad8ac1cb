//! groupd - crash-recoverable group session store
//!
//! A single-record persistent store served over a small text protocol.
//! The record lives in a file-backed heap; every mutation is a transaction
//! whose writes are redo-logged before they reach the heap file, so after a
//! crash the session is either fully updated or untouched.
//!
//! Layers, leaves first: `heap` (durable heap + root slot), `txn`
//! (transaction log and recovery), `session` (GroupSession lifecycle),
//! `protocol` / `dispatch` / `server` (wire format and serving).

pub mod config;
pub mod dispatch;
pub mod error;
pub mod heap;
pub mod protocol;
pub mod server;
pub mod session;
pub mod txn;

pub use config::ServerConfig;
pub use dispatch::{DispatchHandle, Dispatcher, Reply};
pub use error::{Result, StoreError};
pub use heap::{DurableHeap, HeapAddr, HeapStats};
pub use protocol::{Command, ProtocolError};
pub use server::Server;
pub use session::SessionStore;
pub use txn::{DurabilityMode, Transaction, TransactionLog};
