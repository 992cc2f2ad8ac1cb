//! Durable heap: a file-backed byte region that survives restarts.
//!
//! The heap file is loaded into an owned in-memory image at open. All
//! mutation happens on the image inside a `Transaction`; the file itself is
//! only written when the transaction log applies committed records. The
//! root slot in the header locates the live record after a restart.
//!
//! Allocation is first-fit over an implicit block list (see `layout`).
//! Allocator metadata changes are declared on the transaction here, so
//! callers only declare the payload ranges they write themselves.

pub mod layout;

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Result, StoreError};
use crate::txn::{LogRecord, Transaction, TransactionLog};
use layout::*;

/// Offset of a payload inside the heap file. Never zero: offset 0 is the
/// header, so zero is free to act as the null root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapAddr(NonZeroU64);

impl HeapAddr {
    pub fn new(offset: u64) -> Option<Self> {
        NonZeroU64::new(offset).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for HeapAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.get())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub heap_size: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub largest_free: usize,
}

pub struct DurableHeap {
    path: PathBuf,
    file: File,
    image: Vec<u8>,
}

impl DurableHeap {
    /// Open the heap file at `path`, initializing it if missing or empty.
    ///
    /// Committed records still in `log` are replayed into the file before
    /// the image is loaded and validated, so the returned heap is always
    /// consistent. `init_size` is only used for a new heap.
    pub fn open(path: &Path, log: &mut TransactionLog, init_size: u64) -> Result<Self> {
        let needs_init = match std::fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if needs_init {
            write_initial(path, init_size)?;
            tracing::info!(heap = %path.display(), size = init_size, "initialized empty heap");
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        log.replay_into(&mut file)?;

        let mmap = unsafe { Mmap::map(&file) }.map_err(StoreError::Io)?;
        let image = mmap.to_vec();
        drop(mmap);

        let heap = Self {
            path: path.to_path_buf(),
            file,
            image,
        };
        heap.validate()?;
        Ok(heap)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.image.len() as u64
    }

    /// Current root. Reads the image directly; no transaction needed.
    pub fn read_root(&self) -> Option<HeapAddr> {
        HeapAddr::new(read_u64(&self.image, ROOT_OFFSET as usize))
    }

    /// Stage a new root value. The root slot must already be declared on `txn`.
    pub fn write_root(&mut self, txn: &mut Transaction, root: Option<HeapAddr>) -> Result<()> {
        let value = root.map_or(0, HeapAddr::get);
        self.write_raw(txn, ROOT_OFFSET, &value.to_le_bytes())
    }

    /// Reserve `size` bytes. The block headers touched are declared on `txn`;
    /// the payload is not, and keeps whatever bytes it held before.
    pub fn allocate(&mut self, txn: &mut Transaction, size: usize) -> Result<HeapAddr> {
        let need = BLOCK_HEADER_SIZE + align_up(size.max(1));

        let mut offset = HEAP_HEADER_SIZE as u64;
        while offset < self.size() {
            let block = self.block_at(offset)?;
            if block.is_free() && block.size as usize >= need {
                let remainder = block.size as usize - need;
                if remainder >= MIN_BLOCK_SIZE {
                    let split_at = offset + need as u64;
                    self.put_block(txn, split_at, BlockHeader::free(remainder as u64));
                    self.put_block(txn, offset, BlockHeader::allocated(need as u64));
                } else {
                    self.put_block(txn, offset, BlockHeader::allocated(block.size));
                }
                let addr = offset + BLOCK_HEADER_SIZE as u64;
                tracing::debug!(addr, size, "allocated");
                return HeapAddr::new(addr).ok_or(StoreError::InvalidAddress(addr));
            }
            offset += block.size;
        }

        Err(StoreError::OutOfSpace {
            requested: size,
            largest_free: self.stats().largest_free,
        })
    }

    /// Release the block whose payload starts at `addr`, coalescing with free
    /// neighbours. The payload bytes are left untouched.
    pub fn free(&mut self, txn: &mut Transaction, addr: HeapAddr) -> Result<()> {
        let target = addr.get() - BLOCK_HEADER_SIZE as u64;

        let mut prev: Option<(u64, BlockHeader)> = None;
        let mut offset = HEAP_HEADER_SIZE as u64;
        while offset < self.size() {
            let block = self.block_at(offset)?;
            if offset == target {
                if block.is_free() {
                    return Err(StoreError::InvalidAddress(addr.get()));
                }
                let mut start = offset;
                let mut size = block.size;

                let next_offset = offset + block.size;
                if next_offset < self.size() {
                    let next = self.block_at(next_offset)?;
                    if next.is_free() {
                        size += next.size;
                    }
                }
                if let Some((prev_offset, prev_block)) = prev {
                    if prev_block.is_free() {
                        start = prev_offset;
                        size += prev_block.size;
                    }
                }

                self.put_block(txn, start, BlockHeader::free(size));
                tracing::debug!(addr = %addr, "freed");
                return Ok(());
            }
            prev = Some((offset, block));
            offset += block.size;
        }

        Err(StoreError::InvalidAddress(addr.get()))
    }

    /// Read `len` bytes of the payload at `addr`.
    pub fn read(&self, addr: HeapAddr, len: usize) -> Result<&[u8]> {
        if len > self.payload_len(addr)? {
            return Err(StoreError::InvalidAddress(addr.get() + len as u64));
        }
        self.bytes(addr.get(), len)
    }

    /// Write `bytes` at the start of the payload at `addr`. The range must be
    /// declared on `txn` first.
    pub fn write(&mut self, txn: &mut Transaction, addr: HeapAddr, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.payload_len(addr)? {
            return Err(StoreError::InvalidAddress(addr.get() + bytes.len() as u64));
        }
        self.write_raw(txn, addr.get(), bytes)
    }

    /// Usable length of the allocated block at `addr`.
    pub fn payload_len(&self, addr: HeapAddr) -> Result<usize> {
        let target = addr.get().wrapping_sub(BLOCK_HEADER_SIZE as u64);
        let mut offset = HEAP_HEADER_SIZE as u64;
        while offset < self.size() {
            let block = self.block_at(offset)?;
            if offset == target && !block.is_free() {
                return Ok(block.payload_len());
            }
            if offset >= target {
                break;
            }
            offset += block.size;
        }
        Err(StoreError::InvalidAddress(addr.get()))
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.size(),
            free_bytes: 0,
            used_bytes: 0,
            allocated_blocks: 0,
            free_blocks: 0,
            largest_free: 0,
        };
        let mut offset = HEAP_HEADER_SIZE as u64;
        while let Ok(block) = self.block_at(offset) {
            if block.is_free() {
                stats.free_bytes += block.payload_len() as u64;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(block.payload_len());
            } else {
                stats.used_bytes += block.payload_len() as u64;
                stats.allocated_blocks += 1;
            }
            offset += block.size;
        }
        stats
    }

    /// Raw bounds-checked view of the image.
    pub(crate) fn bytes(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len as u64)
            .ok_or(StoreError::InvalidAddress(offset))?;
        if end > self.size() {
            return Err(StoreError::InvalidAddress(offset));
        }
        Ok(&self.image[offset as usize..end as usize])
    }

    /// Put back the old contents of every range declared on `txn`.
    pub(crate) fn rollback(&mut self, txn: &Transaction) {
        for (offset, old) in txn.undo_entries() {
            let start = offset as usize;
            self.image[start..start + old.len()].copy_from_slice(old);
        }
    }

    /// Write a committed record's ranges to the heap file.
    pub(crate) fn apply(&mut self, record: &LogRecord) -> Result<()> {
        for range in &record.ranges {
            self.file.seek(SeekFrom::Start(range.offset))?;
            self.file.write_all(&range.bytes)?;
        }
        Ok(())
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn write_raw(&mut self, txn: &mut Transaction, offset: u64, bytes: &[u8]) -> Result<()> {
        self.bytes(offset, bytes.len())?;
        if !txn.covers(offset, bytes.len()) {
            return Err(StoreError::UnmarkedRange { offset, len: bytes.len() });
        }
        let start = offset as usize;
        self.image[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Declare and write an allocator block header.
    fn put_block(&mut self, txn: &mut Transaction, offset: u64, header: BlockHeader) {
        let start = offset as usize;
        let end = start + BLOCK_HEADER_SIZE;
        txn.snapshot(offset, &self.image[start..end]);
        self.image[start..end].copy_from_slice(&header.to_bytes());
    }

    fn block_at(&self, offset: u64) -> Result<BlockHeader> {
        let raw = self.bytes(offset, BLOCK_HEADER_SIZE).map_err(|_| {
            StoreError::CorruptHeader(format!("block header at {:#x} out of bounds", offset))
        })?;
        let block = BlockHeader::from_bytes(raw);
        if (block.size as usize) < MIN_BLOCK_SIZE
            || block.size as usize % BLOCK_ALIGN != 0
            || offset + block.size > self.size()
            || block.state > BLOCK_ALLOCATED
        {
            return Err(StoreError::CorruptHeader(format!(
                "invalid block at {:#x}: size {} state {}",
                offset, block.size, block.state
            )));
        }
        Ok(block)
    }

    /// Structural validation: header, block chain, root target.
    /// `block_at` bounds every block, so a chain that walks off the end fails there.
    fn validate(&self) -> Result<()> {
        let header = HeapHeader::from_bytes(&self.image)?;
        if header.heap_size != self.size() {
            return Err(StoreError::CorruptHeader(format!(
                "header declares {} bytes, file has {}",
                header.heap_size,
                self.size()
            )));
        }

        let mut offset = HEAP_HEADER_SIZE as u64;
        let mut root_found = header.root == 0;
        while offset < self.size() {
            let block = self.block_at(offset)?;
            if !block.is_free() && offset + BLOCK_HEADER_SIZE as u64 == header.root {
                root_found = true;
            }
            offset += block.size;
        }
        if !root_found {
            return Err(StoreError::CorruptHeader(format!(
                "root {:#x} does not point at an allocated block",
                header.root
            )));
        }
        Ok(())
    }
}

/// Write a fresh heap next to `path` and move it into place.
fn write_initial(path: &Path, heap_size: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let image = initial_image(heap_size)?;
    let tmp = path.with_extension("init");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&image)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::DurabilityMode;
    use tempfile::tempdir;

    fn open_pair(dir: &Path, size: u64) -> (DurableHeap, TransactionLog) {
        let mut log = TransactionLog::open(&dir.join("LOG")).unwrap();
        let heap = DurableHeap::open(&dir.join("DATA"), &mut log, size).unwrap();
        (heap, log)
    }

    #[test]
    fn test_open_initializes_empty_heap() {
        let dir = tempdir().unwrap();
        let (heap, _log) = open_pair(dir.path(), 4096);

        assert_eq!(heap.size(), 4096);
        assert_eq!(heap.read_root(), None);
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.largest_free, 4096 - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE);
    }

    #[test]
    fn test_open_initializes_zero_length_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("DATA"), b"").unwrap();

        let (heap, _log) = open_pair(dir.path(), 2048);
        assert_eq!(heap.size(), 2048);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("DATA"), vec![0x5a; 4096]).unwrap();

        let mut log = TransactionLog::open(&dir.path().join("LOG")).unwrap();
        let err = DurableHeap::open(&dir.path().join("DATA"), &mut log, 4096)
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::CorruptHeader(_)));
    }

    #[test]
    fn test_open_rejects_truncated_heap() {
        let dir = tempdir().unwrap();
        drop(open_pair(dir.path(), 4096));

        let file = OpenOptions::new().write(true).open(dir.path().join("DATA")).unwrap();
        file.set_len(2048).unwrap();

        let mut log = TransactionLog::open(&dir.path().join("LOG")).unwrap();
        let err = DurableHeap::open(&dir.path().join("DATA"), &mut log, 4096)
            .err()
            .unwrap();
        assert!(err.to_string().contains("header declares"));
    }

    #[test]
    fn test_open_rejects_dangling_root() {
        let dir = tempdir().unwrap();
        drop(open_pair(dir.path(), 4096));

        let path = dir.path().join("DATA");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[ROOT_OFFSET as usize..ROOT_OFFSET as usize + 8].copy_from_slice(&200u64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let mut log = TransactionLog::open(&dir.path().join("LOG")).unwrap();
        let err = DurableHeap::open(&path, &mut log, 4096).err().unwrap();
        assert!(err.to_string().contains("does not point at an allocated block"));
    }

    #[test]
    fn test_allocate_splits_and_free_coalesces() {
        let dir = tempdir().unwrap();
        let (mut heap, mut log) = open_pair(dir.path(), 4096);

        let mut txn = log.begin().unwrap();
        let a = heap.allocate(&mut txn, 100).unwrap();
        let b = heap.allocate(&mut txn, 200).unwrap();
        assert_eq!(a.get(), (HEAP_HEADER_SIZE + BLOCK_HEADER_SIZE) as u64);
        assert_eq!(b.get(), a.get() + align_up(100) as u64 + BLOCK_HEADER_SIZE as u64);
        assert_eq!(heap.payload_len(a).unwrap(), 112);
        assert_eq!(heap.stats().allocated_blocks, 2);

        heap.free(&mut txn, a).unwrap();
        heap.free(&mut txn, b).unwrap();
        log.commit(txn, &mut heap, DurabilityMode::Flush).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn test_freed_block_is_reused() {
        let dir = tempdir().unwrap();
        let (mut heap, mut log) = open_pair(dir.path(), 4096);

        let mut txn = log.begin().unwrap();
        let a = heap.allocate(&mut txn, 1000).unwrap();
        heap.free(&mut txn, a).unwrap();
        let b = heap.allocate(&mut txn, 1000).unwrap();
        log.commit(txn, &mut heap, DurabilityMode::Flush).unwrap();

        assert_eq!(a, b);
    }

    #[test]
    fn test_out_of_space() {
        let dir = tempdir().unwrap();
        let (mut heap, mut log) = open_pair(dir.path(), 1024);

        let mut txn = log.begin().unwrap();
        let err = heap.allocate(&mut txn, 2000).unwrap_err();
        match err {
            StoreError::OutOfSpace { requested, largest_free } => {
                assert_eq!(requested, 2000);
                assert_eq!(largest_free, 1024 - HEAP_HEADER_SIZE - BLOCK_HEADER_SIZE);
            }
            other => panic!("expected OutOfSpace, got {:?}", other),
        }
        log.abort(txn, &mut heap).unwrap();
    }

    #[test]
    fn test_double_free_rejected() {
        let dir = tempdir().unwrap();
        let (mut heap, mut log) = open_pair(dir.path(), 4096);

        let mut txn = log.begin().unwrap();
        let a = heap.allocate(&mut txn, 64).unwrap();
        heap.free(&mut txn, a).unwrap();
        let err = heap.free(&mut txn, a).unwrap_err();
        assert!(matches!(err, StoreError::InvalidAddress(_)));
        log.abort(txn, &mut heap).unwrap();
    }

    #[test]
    fn test_write_requires_declared_range() {
        let dir = tempdir().unwrap();
        let (mut heap, mut log) = open_pair(dir.path(), 4096);

        let mut txn = log.begin().unwrap();
        let a = heap.allocate(&mut txn, 64).unwrap();
        let err = heap.write(&mut txn, a, b"hello").unwrap_err();
        assert!(matches!(err, StoreError::UnmarkedRange { len: 5, .. }));

        let err = heap.write_root(&mut txn, Some(a)).unwrap_err();
        assert!(matches!(err, StoreError::UnmarkedRange { offset: ROOT_OFFSET, .. }));

        log.mark_dirty(&mut txn, &heap, a.get(), 5).unwrap();
        heap.write(&mut txn, a, b"hello").unwrap();
        log.commit(txn, &mut heap, DurabilityMode::Flush).unwrap();
        assert_eq!(heap.read(a, 5).unwrap(), b"hello");
    }

    #[test]
    fn test_write_past_payload_rejected() {
        let dir = tempdir().unwrap();
        let (mut heap, mut log) = open_pair(dir.path(), 4096);

        let mut txn = log.begin().unwrap();
        let a = heap.allocate(&mut txn, 16).unwrap();
        log.mark_dirty(&mut txn, &heap, a.get(), 64).unwrap();
        let err = heap.write(&mut txn, a, &[1u8; 64]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidAddress(_)));
        log.abort(txn, &mut heap).unwrap();
    }

    #[test]
    fn test_root_survives_reopen() {
        let dir = tempdir().unwrap();
        let addr;
        {
            let (mut heap, mut log) = open_pair(dir.path(), 4096);
            let mut txn = log.begin().unwrap();
            addr = heap.allocate(&mut txn, 32).unwrap();
            log.mark_dirty(&mut txn, &heap, ROOT_OFFSET, ROOT_SIZE).unwrap();
            heap.write_root(&mut txn, Some(addr)).unwrap();
            log.commit(txn, &mut heap, DurabilityMode::Flush).unwrap();
        }

        let (heap, _log) = open_pair(dir.path(), 4096);
        assert_eq!(heap.read_root(), Some(addr));
        assert_eq!(heap.payload_len(addr).unwrap(), 32);
    }

    #[test]
    fn test_uncommitted_changes_not_durable() {
        let dir = tempdir().unwrap();
        {
            let (mut heap, mut log) = open_pair(dir.path(), 4096);
            let mut txn = log.begin().unwrap();
            let addr = heap.allocate(&mut txn, 32).unwrap();
            log.mark_dirty(&mut txn, &heap, ROOT_OFFSET, ROOT_SIZE).unwrap();
            heap.write_root(&mut txn, Some(addr)).unwrap();
            // dropped while Active
        }

        let (heap, _log) = open_pair(dir.path(), 4096);
        assert_eq!(heap.read_root(), None);
        assert_eq!(heap.stats().allocated_blocks, 0);
    }

    #[test]
    fn test_heap_addr_null_and_display() {
        assert!(HeapAddr::new(0).is_none());
        assert_eq!(HeapAddr::new(0x50).unwrap().to_string(), "0x50");
    }
}
