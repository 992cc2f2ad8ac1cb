//! Server configuration
//!
//! Defaults, optionally overlaid by a JSON file, then by command-line flags.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::heap::layout::{align_up, BLOCK_ALIGN, BLOCK_HEADER_SIZE, HEAP_HEADER_SIZE};

/// Default TCP port of the group photo backend
pub const DEFAULT_PORT: u16 = 9995;

/// Default capacity of the GroupSession buffer
pub const DEFAULT_SESSION_CAPACITY: usize = 1000;

/// Default heap file size for freshly initialized heaps
pub const DEFAULT_HEAP_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub data_path: PathBuf,
    pub log_path: PathBuf,
    /// Only used when a new heap file is initialized; an existing heap keeps its size.
    pub heap_size: u64,
    pub session_capacity: usize,
    /// Bytes a connection may buffer without a terminator before it is dropped
    pub max_record_size: usize,
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            data_path: PathBuf::from("rvm/DATA"),
            log_path: PathBuf::from("rvm/LOG"),
            heap_size: DEFAULT_HEAP_SIZE,
            session_capacity: DEFAULT_SESSION_CAPACITY,
            max_record_size: 64 * 1024,
            shutdown_grace_ms: 2000,
        }
    }
}

impl ServerConfig {
    /// Config rooted in `dir` (heap and log side by side), everything else default.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            data_path: dir.join("DATA"),
            log_path: dir.join("LOG"),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply command-line overrides. Unknown flags are ignored.
    ///
    /// `args` excludes the program name.
    pub fn apply_args(&mut self, args: &[String]) -> Result<()> {
        let value_of = |flag: &str| -> Option<&str> {
            args.iter()
                .position(|a| a == flag)
                .and_then(|i| args.get(i + 1))
                .map(|s| s.as_str())
        };

        if let Some(addr) = value_of("--listen") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| StoreError::Config(format!("--listen '{}': {}", addr, e)))?;
        }
        if let Some(path) = value_of("--data") {
            self.data_path = PathBuf::from(path);
        }
        if let Some(path) = value_of("--log") {
            self.log_path = PathBuf::from(path);
        }
        if let Some(size) = value_of("--heap-size") {
            self.heap_size = size
                .parse()
                .map_err(|e| StoreError::Config(format!("--heap-size '{}': {}", size, e)))?;
        }
        if let Some(cap) = value_of("--capacity") {
            self.session_capacity = cap
                .parse()
                .map_err(|e| StoreError::Config(format!("--capacity '{}': {}", cap, e)))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_capacity == 0 {
            return Err(StoreError::Config("session capacity must be non-zero".into()));
        }
        if self.session_capacity as u64 > self.heap_size {
            return Err(StoreError::Config(format!(
                "session capacity {} exceeds heap size {}",
                self.session_capacity, self.heap_size
            )));
        }
        let overhead = HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE + BLOCK_ALIGN - 1;
        let min_heap = match self.session_capacity.checked_add(overhead) {
            Some(_) => (HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE + align_up(self.session_capacity)) as u64,
            None => {
                return Err(StoreError::Config(format!(
                    "session capacity {} is too large",
                    self.session_capacity
                )))
            }
        };
        if self.heap_size < min_heap {
            return Err(StoreError::Config(format!(
                "heap size {} cannot hold a session of {} bytes (need at least {})",
                self.heap_size, self.session_capacity, min_heap
            )));
        }
        if self.heap_size % BLOCK_ALIGN as u64 != 0 {
            return Err(StoreError::Config(format!(
                "heap size {} is not a multiple of {}",
                self.heap_size, BLOCK_ALIGN
            )));
        }
        if self.max_record_size < self.session_capacity {
            return Err(StoreError::Config(format!(
                "max record size {} is smaller than session capacity {}",
                self.max_record_size, self.session_capacity
            )));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.shutdown_grace_ms)
    }
}
