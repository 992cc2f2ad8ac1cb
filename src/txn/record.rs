//! Transaction log record framing.
//!
//! ```text
//! [magic u32 "GTX1"][body_len u32][blake3(body) 32 bytes][bincode body]
//! ```
//!
//! A record is only trusted when the whole frame is present and the
//! checksum matches. Anything after the first bad frame is discarded.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Record magic (ASCII "GTX1")
pub const RECORD_MAGIC: u32 = 0x4754_5831;

/// magic + body_len + checksum
pub const RECORD_HEADER_SIZE: usize = 4 + 4 + 32;

/// Upper bound for a single record body
pub const MAX_RECORD_BODY: usize = 100 * 1024 * 1024;

/// New value of one byte range of the heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeWrite {
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Redo record for one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub txn_id: u64,
    pub ranges: Vec<RangeWrite>,
}

/// Outcome of decoding one frame from the head of a buffer.
#[derive(Debug)]
pub enum FrameRead {
    /// Valid record and the number of bytes it occupied
    Complete(LogRecord, usize),
    /// Buffer ends before the frame does (torn write)
    Incomplete,
    /// Frame is present but invalid
    Corrupt(String),
}

impl LogRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let checksum = blake3::hash(&body);

        let mut frame = Vec::with_capacity(RECORD_HEADER_SIZE + body.len());
        frame.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(checksum.as_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    pub fn decode_frame(buf: &[u8]) -> FrameRead {
        if buf.len() < RECORD_HEADER_SIZE {
            return FrameRead::Incomplete;
        }
        let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != RECORD_MAGIC {
            return FrameRead::Corrupt(format!("bad record magic {:#010x}", magic));
        }
        let body_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        if body_len > MAX_RECORD_BODY {
            return FrameRead::Corrupt(format!("record body too large: {} bytes", body_len));
        }
        let end = RECORD_HEADER_SIZE + body_len;
        if buf.len() < end {
            return FrameRead::Incomplete;
        }

        let body = &buf[RECORD_HEADER_SIZE..end];
        if blake3::hash(body).as_bytes() != &buf[8..RECORD_HEADER_SIZE] {
            return FrameRead::Corrupt("checksum mismatch".into());
        }
        match bincode::deserialize::<LogRecord>(body) {
            Ok(record) => FrameRead::Complete(record, end),
            Err(e) => FrameRead::Corrupt(format!("undecodable record body: {}", e)),
        }
    }

    /// Total payload bytes carried by this record
    pub fn payload_bytes(&self) -> usize {
        self.ranges.iter().map(|r| r.bytes.len()).sum()
    }
}

/// Result of scanning a whole log file.
#[derive(Debug, Default)]
pub struct LogScan {
    pub records: Vec<LogRecord>,
    /// Length of the trusted prefix
    pub valid_len: usize,
    /// Why the scan stopped early, if it did
    pub discarded: Option<String>,
}

/// Decode records from the start of `buf` until the first incomplete or corrupt frame.
pub fn scan(buf: &[u8]) -> LogScan {
    let mut out = LogScan::default();
    let mut pos = 0;

    while pos < buf.len() {
        match LogRecord::decode_frame(&buf[pos..]) {
            FrameRead::Complete(record, used) => {
                out.records.push(record);
                pos += used;
            }
            FrameRead::Incomplete => {
                out.discarded = Some(format!("incomplete record at offset {}", pos));
                break;
            }
            FrameRead::Corrupt(reason) => {
                out.discarded = Some(format!("{} at offset {}", reason, pos));
                break;
            }
        }
    }

    out.valid_len = pos;
    out
}
