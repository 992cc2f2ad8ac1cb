//! On-disk layout of the heap file.
//!
//! ```text
//! [Header 64 bytes]
//! [Block header 16 bytes][payload, 16-byte aligned]
//! [Block header 16 bytes][payload]
//! ...
//! ```
//!
//! Blocks tile the arena exactly: the last block ends at `heap_size`.

use std::io::Write;

use crate::error::{Result, StoreError};

// ── Constants ──────────────────────────────────────────────────────

/// Magic bytes for heap files
pub const HEAP_MAGIC: [u8; 4] = *b"GRPH";

/// Format version
pub const HEAP_VERSION: u16 = 1;

/// Heap header size in bytes
pub const HEAP_HEADER_SIZE: usize = 64;

/// Offset of the root slot inside the header
pub const ROOT_OFFSET: u64 = 16;

/// Size of the root slot (one little-endian u64)
pub const ROOT_SIZE: usize = 8;

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Block sizes are multiples of this
pub const BLOCK_ALIGN: usize = 16;

/// Smallest block worth splitting off (header + one aligned unit)
pub const MIN_BLOCK_SIZE: usize = BLOCK_HEADER_SIZE + BLOCK_ALIGN;

pub const BLOCK_FREE: u64 = 0;
pub const BLOCK_ALLOCATED: u64 = 1;

/// Round `n` up to the block alignment.
pub fn align_up(n: usize) -> usize {
    (n + BLOCK_ALIGN - 1) & !(BLOCK_ALIGN - 1)
}

// ── Heap Header ────────────────────────────────────────────────────

/// Heap file header, exactly 64 bytes on disk.
///
/// ```text
/// Offset  Size  Field
/// 0       4     magic: b"GRPH"
/// 4       2     version: u16 = 1
/// 6       2     reserved
/// 8       8     heap_size: u64 (total file length)
/// 16      8     root: u64 (payload offset, 0 = null)
/// 24      40    reserved
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub heap_size: u64,
    pub root: u64,
}

impl HeapHeader {
    pub fn new(heap_size: u64) -> Self {
        Self {
            magic: HEAP_MAGIC,
            version: HEAP_VERSION,
            heap_size,
            root: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != HEAP_MAGIC {
            return Err(StoreError::CorruptHeader(format!(
                "not a heap file: expected GRPH, got {:?}",
                self.magic
            )));
        }
        if self.version != HEAP_VERSION {
            return Err(StoreError::CorruptHeader(format!(
                "unsupported heap version: {}",
                self.version
            )));
        }
        if self.heap_size < (HEAP_HEADER_SIZE + MIN_BLOCK_SIZE) as u64 {
            return Err(StoreError::CorruptHeader(format!(
                "heap size {} too small",
                self.heap_size
            )));
        }
        Ok(())
    }

    /// Parse header from byte slice (>= HEAP_HEADER_SIZE bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEAP_HEADER_SIZE {
            return Err(StoreError::CorruptHeader("file too small for heap header".into()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let header = Self {
            magic,
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            heap_size: read_u64(bytes, 8),
            root: read_u64(bytes, ROOT_OFFSET as usize),
        };
        header.validate()?;
        Ok(header)
    }

    /// Write header to writer (exactly HEAP_HEADER_SIZE bytes).
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?; // reserved
        writer.write_all(&self.heap_size.to_le_bytes())?;
        writer.write_all(&self.root.to_le_bytes())?;
        writer.write_all(&[0u8; 40])?; // reserved
        Ok(())
    }
}

// ── Block Header ───────────────────────────────────────────────────

/// Allocator block header: 16 bytes preceding every payload.
///
/// ```text
/// Offset  Size  Field
/// 0       8     size: u64 (header + payload)
/// 8       8     state: u64 (0 = free, 1 = allocated)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub size: u64,
    pub state: u64,
}

impl BlockHeader {
    pub fn free(size: u64) -> Self {
        Self { size, state: BLOCK_FREE }
    }

    pub fn allocated(size: u64) -> Self {
        Self { size, state: BLOCK_ALLOCATED }
    }

    pub fn is_free(&self) -> bool {
        self.state == BLOCK_FREE
    }

    pub fn payload_len(&self) -> usize {
        self.size as usize - BLOCK_HEADER_SIZE
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            size: read_u64(bytes, 0),
            state: read_u64(bytes, 8),
        }
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..16].copy_from_slice(&self.state.to_le_bytes());
        out
    }
}

pub(crate) fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Build a fresh heap image: header with a null root, one free block spanning the arena.
pub fn initial_image(heap_size: u64) -> Result<Vec<u8>> {
    let header = HeapHeader::new(heap_size);
    header.validate()?;

    if heap_size as usize % BLOCK_ALIGN != 0 {
        return Err(StoreError::Config(format!(
            "heap size {} is not a multiple of {}",
            heap_size, BLOCK_ALIGN
        )));
    }
    let arena = heap_size as usize - HEAP_HEADER_SIZE;

    let mut image = Vec::with_capacity(heap_size as usize);
    header.write_to(&mut image)?;
    image.extend_from_slice(&BlockHeader::free(arena as u64).to_bytes());
    image.resize(heap_size as usize, 0);
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_write_read_roundtrip() {
        let mut header = HeapHeader::new(4096);
        header.root = 80;
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEAP_HEADER_SIZE);

        let parsed = HeapHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(read_u64(&buf, ROOT_OFFSET as usize), 80);
    }

    #[test]
    fn test_header_wrong_magic() {
        let mut buf = Vec::new();
        HeapHeader::new(4096).write_to(&mut buf).unwrap();
        buf[0..4].copy_from_slice(b"XXXX");
        let err = HeapHeader::from_bytes(&buf).unwrap_err();
        assert!(err.to_string().contains("not a heap file"));
    }

    #[test]
    fn test_header_wrong_version() {
        let mut buf = Vec::new();
        HeapHeader::new(4096).write_to(&mut buf).unwrap();
        buf[4] = 9;
        let err = HeapHeader::from_bytes(&buf).unwrap_err();
        assert!(err.to_string().contains("unsupported heap version"));
    }

    #[test]
    fn test_header_too_small() {
        let err = HeapHeader::from_bytes(&[0u8; 10]).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_initial_image() {
        let image = initial_image(1024).unwrap();
        assert_eq!(image.len(), 1024);

        let header = HeapHeader::from_bytes(&image).unwrap();
        assert_eq!(header.root, 0);
        let block = BlockHeader::from_bytes(&image[HEAP_HEADER_SIZE..]);
        assert!(block.is_free());
        assert_eq!(block.size, 1024 - HEAP_HEADER_SIZE as u64);
    }

    #[test]
    fn test_initial_image_unaligned_size() {
        assert!(initial_image(1000).is_err());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 16);
        assert_eq!(align_up(16), 16);
        assert_eq!(align_up(1000), 1008);
    }
}
