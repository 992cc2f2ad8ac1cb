//! Wire protocol
//!
//! ASCII commands of the form `<command>[:<payload>]$`:
//!
//! | command            | reply                                  |
//! |--------------------|----------------------------------------|
//! | `new`              | none                                   |
//! | `store:<payload>$` | none                                   |
//! | `restore`          | session bytes up to NUL, or `groupNotFound$\0` |
//! | `remove`           | none                                   |
//!
//! The payload of `store` runs from the first `:` to the LAST `$` of the
//! record, so it may contain `:` and `$` itself.

use thiserror::Error;

/// Separates the command keyword from its payload
pub const CMD_MARKER: u8 = b':';

/// Ends a record
pub const END_MARKER: u8 = b'$';

/// Reply to `restore` when no session exists
pub const GROUP_NOT_FOUND: &[u8] = b"groupNotFound$\0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    New,
    Store(Vec<u8>),
    Restore,
    Remove,
    Unknown(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("record has no '$' terminator")]
    MissingTerminator,

    #[error("store command without ':' payload marker")]
    MissingPayloadMarker,
}

impl Command {
    /// Decode one record.
    pub fn parse(record: &[u8]) -> Result<Command, ProtocolError> {
        let record = record.trim_ascii_start();
        let end = record
            .iter()
            .rposition(|&b| b == END_MARKER)
            .ok_or(ProtocolError::MissingTerminator)?;

        // Keyword ends at the first marker of either kind
        let keyword_end = record
            .iter()
            .position(|&b| b == CMD_MARKER || b == END_MARKER)
            .unwrap_or(end);
        let keyword = &record[..keyword_end];

        let command = match keyword {
            b"new" => Command::New,
            b"restore" => Command::Restore,
            b"remove" => Command::Remove,
            b"store" => {
                if record[keyword_end] != CMD_MARKER {
                    return Err(ProtocolError::MissingPayloadMarker);
                }
                Command::Store(record[keyword_end + 1..end].to_vec())
            }
            other => Command::Unknown(String::from_utf8_lossy(other).into_owned()),
        };
        Ok(command)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::New => "new",
            Command::Store(_) => "store",
            Command::Restore => "restore",
            Command::Remove => "remove",
            Command::Unknown(_) => "unknown",
        }
    }
}

/// Bytes persisted for `store:<payload>$`: the payload, its terminator and a NUL,
/// so a later `restore` reply is self-terminating.
pub fn session_record(payload: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(payload.len() + 2);
    record.extend_from_slice(payload);
    record.push(END_MARKER);
    record.push(0);
    record
}

/// Reply to `restore`: the session bytes up to and including the first NUL.
pub fn restore_response(session: &[u8]) -> Vec<u8> {
    match session.iter().position(|&b| b == 0) {
        Some(nul) => session[..=nul].to_vec(),
        None => {
            let mut out = session.to_vec();
            out.push(0);
            out
        }
    }
}
