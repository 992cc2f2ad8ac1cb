//! Transaction log: atomic, crash-recoverable byte-range writes.
//!
//! Redo logging of new values. A transaction declares every range it is
//! about to modify (`mark_dirty`), mutates the in-memory heap image, then
//! commits: the new values of all declared ranges are appended to the log
//! as one checksummed record, the log is synced, and only then are the
//! ranges written to the heap file. Recovery replays complete records and
//! drops a torn tail, so after a crash either every range of a transaction
//! is visible or none is.
//!
//! Single writer: at most one transaction is Active per log.
//!
//! ```text
//! Idle --begin--> Active --commit--> Idle
//!                    \----abort----> Idle
//! ```

pub mod record;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::heap::DurableHeap;

pub use record::{LogRecord, LogScan, RangeWrite};

/// When a commit is forced to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Sync the log and apply to the heap file before returning
    Flush,
    /// Append the record without syncing; applied by the next `flush`
    NoFlush,
}

/// Old contents of a declared range, kept for abort.
#[derive(Debug, Clone)]
struct DirtyRange {
    offset: u64,
    old: Vec<u8>,
}

impl DirtyRange {
    fn end(&self) -> u64 {
        self.offset + self.old.len() as u64
    }
}

/// Handle for the Active transaction.
///
/// Must be passed back to `commit` or `abort`. Dropping it leaves the log
/// Active and every later `begin` fails.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    ranges: Vec<DirtyRange>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether `[offset, offset + len)` lies inside a single declared range.
    /// An empty range is always covered.
    pub fn covers(&self, offset: u64, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let end = offset + len as u64;
        self.ranges
            .iter()
            .any(|r| r.offset <= offset && end <= r.end())
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Record the current contents of a range before it is modified.
    pub(crate) fn snapshot(&mut self, offset: u64, current: &[u8]) {
        if current.is_empty() || self.covers(offset, current.len()) {
            return;
        }
        self.ranges.push(DirtyRange { offset, old: current.to_vec() });
    }

    /// Declared ranges in declaration order, as (offset, len).
    pub(crate) fn declared(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.ranges.iter().map(|r| (r.offset, r.old.len()))
    }

    /// Old contents, newest first (restore order).
    pub(crate) fn undo_entries(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.ranges.iter().rev().map(|r| (r.offset, r.old.as_slice()))
    }
}

pub struct TransactionLog {
    path: PathBuf,
    file: File,
    next_txn_id: u64,
    active: Option<u64>,
    /// Committed with NoFlush, not yet written to the heap file
    deferred: Vec<LogRecord>,
    /// Complete records found at open, waiting for the heap to replay them
    recovered: Vec<LogRecord>,
}

impl TransactionLog {
    /// Open (or create) the log file and scan it for recoverable records.
    ///
    /// A torn or corrupt tail is cut off here; complete records are held
    /// until `DurableHeap::open` replays them.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let scan = record::scan(&buf);

        if let Some(reason) = &scan.discarded {
            tracing::warn!(
                log = %path.display(),
                discarded_bytes = buf.len() - scan.valid_len,
                "discarding incomplete transaction log tail: {}",
                reason
            );
            file.set_len(scan.valid_len as u64)?;
            file.sync_all()?;
        }

        let next_txn_id = scan.records.iter().map(|r| r.txn_id + 1).max().unwrap_or(1);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            next_txn_id,
            active: None,
            deferred: Vec::new(),
            recovered: scan.records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Records committed with `NoFlush` that have not reached the heap file
    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Records awaiting replay (non-zero only between `open` and heap open)
    pub fn pending_recovery(&self) -> usize {
        self.recovered.len()
    }

    pub fn begin(&mut self) -> Result<Transaction> {
        if self.active.is_some() {
            return Err(StoreError::AlreadyActiveTransaction);
        }
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.active = Some(id);
        Ok(Transaction { id, ranges: Vec::new() })
    }

    /// Declare that `[address, address + len)` is about to be modified.
    ///
    /// Must be called before the range is written through the heap.
    pub fn mark_dirty(
        &self,
        txn: &mut Transaction,
        heap: &DurableHeap,
        address: u64,
        len: usize,
    ) -> Result<()> {
        self.check_active(txn)?;
        let current = heap.bytes(address, len)?;
        txn.snapshot(address, current);
        Ok(())
    }

    pub fn commit(
        &mut self,
        txn: Transaction,
        heap: &mut DurableHeap,
        mode: DurabilityMode,
    ) -> Result<()> {
        self.check_active(&txn)?;

        let mut ranges = Vec::with_capacity(txn.range_count());
        for (offset, len) in txn.declared() {
            ranges.push(RangeWrite {
                offset,
                bytes: heap.bytes(offset, len)?.to_vec(),
            });
        }
        let record = LogRecord { txn_id: txn.id, ranges };

        let start_len = self.file.metadata()?.len();
        if let Err(e) = self.append(&record, mode) {
            // Nothing durable yet: undo in memory and cut the partial frame.
            heap.rollback(&txn);
            if let Err(trunc) = self.file.set_len(start_len) {
                tracing::warn!("could not truncate log after failed commit: {}", trunc);
            }
            self.active = None;
            return Err(e);
        }

        self.active = None;
        self.deferred.push(record);

        if mode == DurabilityMode::Flush {
            // The transaction is durable once the log is synced. A failure to
            // apply it to the heap file leaves it deferred for the next flush
            // or for recovery.
            if let Err(e) = self.apply_deferred(heap) {
                tracing::warn!(
                    txn = txn.id,
                    "committed transaction not yet applied to heap file: {}",
                    e
                );
            }
        }
        Ok(())
    }

    /// Discard the transaction and restore the in-memory image.
    pub fn abort(&mut self, txn: Transaction, heap: &mut DurableHeap) -> Result<()> {
        self.check_active(&txn)?;
        heap.rollback(&txn);
        self.active = None;
        tracing::debug!(txn = txn.id, ranges = txn.range_count(), "transaction aborted");
        Ok(())
    }

    /// Force every deferred record to the log and the heap file.
    pub fn flush(&mut self, heap: &mut DurableHeap) -> Result<()> {
        if self.deferred.is_empty() {
            return Ok(());
        }
        self.file.sync_data()?;
        self.apply_deferred(heap)
    }

    /// Apply records found at open to the heap file. Called by `DurableHeap::open`
    /// before the image is loaded.
    pub(crate) fn replay_into(&mut self, heap_file: &mut File) -> Result<usize> {
        if self.recovered.is_empty() {
            return Ok(0);
        }
        let heap_len = heap_file.metadata()?.len();
        let records = std::mem::take(&mut self.recovered);

        for record in &records {
            for range in &record.ranges {
                let end = range.offset + range.bytes.len() as u64;
                if end > heap_len {
                    return Err(StoreError::CorruptLog(format!(
                        "txn {} writes {:#x}..{:#x} beyond heap of {} bytes",
                        record.txn_id, range.offset, end, heap_len
                    )));
                }
                heap_file.seek(SeekFrom::Start(range.offset))?;
                heap_file.write_all(&range.bytes)?;
            }
        }
        heap_file.sync_all()?;
        self.truncate()?;

        tracing::info!(
            log = %self.path.display(),
            transactions = records.len(),
            "replayed committed transactions from log"
        );
        Ok(records.len())
    }

    fn append(&mut self, record: &LogRecord, mode: DurabilityMode) -> Result<()> {
        let frame = record.encode()?;
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&frame)?;
        if mode == DurabilityMode::Flush {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn apply_deferred(&mut self, heap: &mut DurableHeap) -> Result<()> {
        for record in &self.deferred {
            heap.apply(record)?;
        }
        heap.sync()?;
        self.deferred.clear();
        self.truncate()
    }

    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn check_active(&self, txn: &Transaction) -> Result<()> {
        match self.active {
            Some(id) if id == txn.id => Ok(()),
            _ => Err(StoreError::StaleTransaction(txn.id)),
        }
    }
}
