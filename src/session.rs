//! SessionStore - lifecycle of the single persisted GroupSession
//!
//! The session is one fixed-capacity buffer in the durable heap, located
//! through the heap's root slot. Every mutation runs as one transaction
//! committed with `DurabilityMode::Flush`; reads go straight to the image.
//! The root is read fresh at the start of each operation, never cached.

use crate::config::ServerConfig;
use crate::error::{Result, StoreError};
use crate::heap::layout::{ROOT_OFFSET, ROOT_SIZE};
use crate::heap::{DurableHeap, HeapAddr};
use crate::txn::{DurabilityMode, Transaction, TransactionLog};

pub struct SessionStore {
    heap: DurableHeap,
    log: TransactionLog,
    capacity: usize,
}

impl SessionStore {
    /// Open heap and log, replaying any committed-but-unapplied transactions.
    pub fn open(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let mut log = TransactionLog::open(&config.log_path)?;
        let heap = DurableHeap::open(&config.data_path, &mut log, config.heap_size)?;
        Self::from_parts(heap, log, config.session_capacity)
    }

    /// Wrap an already opened heap and log.
    pub fn from_parts(heap: DurableHeap, log: TransactionLog, capacity: usize) -> Result<Self> {
        if let Some(root) = heap.read_root() {
            let len = heap.payload_len(root)?;
            if len < capacity {
                return Err(StoreError::CorruptHeader(format!(
                    "session at {} holds {} bytes, capacity is {}",
                    root, len, capacity
                )));
            }
        }
        tracing::info!(
            heap = %heap.path().display(),
            root = ?heap.read_root(),
            capacity,
            "session store opened"
        );
        Ok(Self { heap, log, capacity })
    }

    pub fn into_parts(self) -> (DurableHeap, TransactionLog) {
        (self.heap, self.log)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Address of the live session, if any.
    pub fn root(&self) -> Option<HeapAddr> {
        self.heap.read_root()
    }

    pub fn heap(&self) -> &DurableHeap {
        &self.heap
    }

    /// Allocate a zero-filled session and point the root at it.
    pub fn create(&mut self) -> Result<()> {
        if self.heap.read_root().is_some() {
            return Err(StoreError::AlreadyExists);
        }
        let capacity = self.capacity;
        self.with_transaction(|heap, log, txn| {
            let addr = heap.allocate(txn, capacity)?;
            log.mark_dirty(txn, heap, addr.get(), capacity)?;
            heap.write(txn, addr, &vec![0u8; capacity])?;
            log.mark_dirty(txn, heap, ROOT_OFFSET, ROOT_SIZE)?;
            heap.write_root(txn, Some(addr))
        })
    }

    /// Overwrite the start of the session buffer with `payload`.
    ///
    /// Bytes past `payload.len()` keep their previous content.
    pub fn update(&mut self, payload: &[u8]) -> Result<()> {
        let addr = self.heap.read_root().ok_or(StoreError::NoActiveSession)?;
        if payload.len() > self.capacity {
            return Err(StoreError::PayloadTooLarge {
                len: payload.len(),
                capacity: self.capacity,
            });
        }
        self.with_transaction(|heap, log, txn| {
            log.mark_dirty(txn, heap, addr.get(), payload.len())?;
            heap.write(txn, addr, payload)
        })
    }

    /// Current session contents (`capacity` bytes), or None without a session.
    pub fn restore(&self) -> Result<Option<&[u8]>> {
        match self.heap.read_root() {
            Some(addr) => Ok(Some(self.heap.read(addr, self.capacity)?)),
            None => Ok(None),
        }
    }

    /// Free the session and clear the root.
    pub fn remove(&mut self) -> Result<()> {
        let addr = self.heap.read_root().ok_or(StoreError::NoActiveSession)?;
        self.with_transaction(|heap, log, txn| {
            heap.free(txn, addr)?;
            log.mark_dirty(txn, heap, ROOT_OFFSET, ROOT_SIZE)?;
            heap.write_root(txn, None)
        })
    }

    /// Force any deferred log records into the heap file.
    pub fn flush(&mut self) -> Result<()> {
        self.log.flush(&mut self.heap)
    }

    /// Run `body` inside one transaction: commit on success, abort on error.
    fn with_transaction<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut DurableHeap, &TransactionLog, &mut Transaction) -> Result<()>,
    {
        let mut txn = self.log.begin()?;
        if let Err(e) = body(&mut self.heap, &self.log, &mut txn) {
            self.log.abort(txn, &mut self.heap)?;
            return Err(e);
        }
        self.log.commit(txn, &mut self.heap, DurabilityMode::Flush)
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    const CAPACITY: usize = 1000;

    fn open_store() -> (TempDir, SessionStore) {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(&ServerConfig::in_dir(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_create_then_restore_is_zero_filled() {
        let (_dir, mut store) = open_store();

        store.create().unwrap();

        let data = store.restore().unwrap().unwrap();
        assert_eq!(data.len(), CAPACITY);
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_create_twice_fails() {
        let (_dir, mut store) = open_store();

        store.create().unwrap();
        let root = store.root();
        let err = store.create().unwrap_err();

        assert!(matches!(err, StoreError::AlreadyExists));
        assert_eq!(store.root(), root);
    }

    #[test]
    fn test_create_reuses_dirty_block_zeroed() {
        let (_dir, mut store) = open_store();

        store.create().unwrap();
        store.update(b"old contents").unwrap();
        store.remove().unwrap();
        store.create().unwrap();

        let data = store.restore().unwrap().unwrap();
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_restore_without_session() {
        let (_dir, store) = open_store();
        assert!(store.restore().unwrap().is_none());
    }

    #[test]
    fn test_update_without_session() {
        let (_dir, mut store) = open_store();
        let err = store.update(b"data").unwrap_err();
        assert!(matches!(err, StoreError::NoActiveSession));
    }

    #[test]
    fn test_empty_update_leaves_buffer_unchanged() {
        let (_dir, mut store) = open_store();
        store.create().unwrap();
        store.update(b"alice|ready#").unwrap();

        store.update(b"").unwrap();

        assert_eq!(&store.restore().unwrap().unwrap()[..12], b"alice|ready#");
        assert!(!store.log.is_active());
    }

    #[test]
    fn test_update_short_payload_keeps_tail() {
        let (_dir, mut store) = open_store();
        store.create().unwrap();

        store.update(b"alice|ready#bob|pending#").unwrap();
        store.update(b"carol").unwrap();

        let data = store.restore().unwrap().unwrap();
        assert_eq!(&data[..24], b"carol|ready#bob|pending#");
        assert!(data[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_update_full_capacity_overwrites_everything() {
        let (_dir, mut store) = open_store();
        store.create().unwrap();
        store.update(b"previous").unwrap();

        let full = vec![b'z'; CAPACITY];
        store.update(&full).unwrap();

        assert_eq!(store.restore().unwrap().unwrap(), full.as_slice());
    }

    #[test]
    fn test_update_too_large() {
        let (_dir, mut store) = open_store();
        store.create().unwrap();
        store.update(b"kept").unwrap();

        let err = store.update(&vec![b'x'; CAPACITY + 1]).unwrap_err();
        match err {
            StoreError::PayloadTooLarge { len, capacity } => {
                assert_eq!(len, CAPACITY + 1);
                assert_eq!(capacity, CAPACITY);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
        assert_eq!(&store.restore().unwrap().unwrap()[..4], b"kept");
    }

    #[test]
    fn test_remove_without_session_leaves_root_null() {
        let (_dir, mut store) = open_store();

        let err = store.remove().unwrap_err();

        assert!(matches!(err, StoreError::NoActiveSession));
        assert_eq!(store.root(), None);
    }

    #[test]
    fn test_remove_frees_storage() {
        let (_dir, mut store) = open_store();
        store.create().unwrap();
        assert_eq!(store.heap().stats().allocated_blocks, 1);

        store.remove().unwrap();

        assert_eq!(store.root(), None);
        assert!(store.restore().unwrap().is_none());
        assert_eq!(store.heap().stats().allocated_blocks, 0);
    }

    #[test]
    fn test_create_out_of_space_leaves_no_trace() {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            heap_size: 1024,
            session_capacity: 900,
            ..ServerConfig::in_dir(dir.path())
        };
        let mut log = TransactionLog::open(&config.log_path).unwrap();
        let mut heap = DurableHeap::open(&config.data_path, &mut log, config.heap_size).unwrap();

        // Eat part of the heap so the session no longer fits
        let mut txn = log.begin().unwrap();
        heap.allocate(&mut txn, 200).unwrap();
        log.commit(txn, &mut heap, DurabilityMode::Flush).unwrap();
        let before = heap.stats();

        let mut store = SessionStore::from_parts(heap, log, config.session_capacity).unwrap();
        let err = store.create().unwrap_err();
        assert!(matches!(err, StoreError::OutOfSpace { .. }));
        assert_eq!(store.root(), None);

        let (mut heap, mut log) = store.into_parts();
        assert_eq!(heap.stats(), before);
        // The failed create left the log idle
        let txn = log.begin().unwrap();
        log.abort(txn, &mut heap).unwrap();
    }

    #[test]
    fn test_session_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::in_dir(dir.path());
        {
            let mut store = SessionStore::open(&config).unwrap();
            store.create().unwrap();
            store.update(b"X\0").unwrap();
        }

        let store = SessionStore::open(&config).unwrap();
        let data = store.restore().unwrap().unwrap();
        assert_eq!(&data[..2], b"X\0");
    }

    #[test]
    fn test_reopen_with_larger_capacity_rejected() {
        let dir = tempdir().unwrap();
        let config = ServerConfig::in_dir(dir.path());
        {
            let mut store = SessionStore::open(&config).unwrap();
            store.create().unwrap();
        }

        let bigger = ServerConfig { session_capacity: 4000, ..config };
        let err = SessionStore::open(&bigger).err().unwrap();
        assert!(matches!(err, StoreError::CorruptHeader(_)));
    }
}
