//! TCP front end
//!
//! One thread per connection. Each connection accumulates bytes until it
//! has seen a `$`, then hands the whole buffered chunk to the parser as a
//! single record (the terminator is the last `$` of that chunk). Parsed
//! commands go to the dispatcher; the connection blocks for the reply
//! before reading more.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crate::config::ServerConfig;
use crate::dispatch::DispatchHandle;
use crate::error::Result;
use crate::protocol::{Command, END_MARKER};

// Global client ID counter
static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

const READ_CHUNK: usize = 4096;

/// Per-connection receive buffer.
pub struct RecordBuffer {
    buf: Vec<u8>,
    max: usize,
}

/// The buffered bytes grew past the configured limit without a terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordTooLarge(pub usize);

impl RecordBuffer {
    pub fn new(max: usize) -> Self {
        Self { buf: Vec::new(), max }
    }

    /// Add received bytes. Returns the buffered record once it holds a terminator.
    pub fn push(&mut self, data: &[u8]) -> std::result::Result<Option<Vec<u8>>, RecordTooLarge> {
        self.buf.extend_from_slice(data);
        if self.buf.contains(&END_MARKER) {
            return Ok(Some(std::mem::take(&mut self.buf)));
        }
        if self.buf.len() > self.max {
            return Err(RecordTooLarge(self.buf.len()));
        }
        Ok(None)
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

pub struct Server {
    listener: TcpListener,
    dispatcher: DispatchHandle,
    max_record_size: usize,
    shutting_down: Arc<AtomicBool>,
}

impl Server {
    pub fn bind(config: &ServerConfig, dispatcher: DispatchHandle) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)?;
        Ok(Self {
            listener,
            dispatcher,
            max_record_size: config.max_record_size,
            shutting_down: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Set to stop accepting new connections.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutting_down)
    }

    /// Accept connections until the shutdown flag is raised.
    pub fn run(self) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "listening");

        for stream in self.listener.incoming() {
            if self.shutting_down.load(Ordering::SeqCst) {
                tracing::info!("shutting down, no longer accepting connections");
                break;
            }
            match stream {
                Ok(stream) => {
                    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                    let dispatcher = self.dispatcher.clone();
                    let max = self.max_record_size;
                    let spawned = thread::Builder::new()
                        .name(format!("groupd-client-{}", client_id))
                        .spawn(move || handle_tcp_client(stream, dispatcher, client_id, max));
                    if let Err(e) = spawned {
                        tracing::warn!(client = client_id, "could not spawn connection thread: {}", e);
                    }
                }
                Err(e) => {
                    tracing::warn!("accept error: {}", e);
                }
            }
        }
    }
}

fn handle_tcp_client(stream: TcpStream, dispatcher: DispatchHandle, client_id: usize, max: usize) {
    let peer = stream.peer_addr().ok();
    tracing::info!(client = client_id, peer = ?peer, "connection accepted");
    handle_connection(stream, &dispatcher, client_id, max);
}

/// Serve one client until it disconnects or must be dropped.
pub fn handle_connection<S: Read + Write>(
    mut stream: S,
    dispatcher: &DispatchHandle,
    client_id: usize,
    max_record_size: usize,
) {
    let mut records = RecordBuffer::new(max_record_size);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) => {
                tracing::info!(client = client_id, pending = records.pending(), "client disconnected");
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(client = client_id, "read error: {}", e);
                break;
            }
        };

        let record = match records.push(&chunk[..n]) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(RecordTooLarge(len)) => {
                tracing::warn!(client = client_id, len, "record too large, dropping connection");
                break;
            }
        };

        let command = match Command::parse(&record) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(client = client_id, "malformed record ignored: {}", e);
                continue;
            }
        };

        let Some(reply) = dispatcher.submit(command) else {
            tracing::info!(client = client_id, "dispatcher stopped, closing connection");
            break;
        };

        if let Some(response) = reply.response {
            if let Err(e) = stream.write_all(&response).and_then(|_| stream.flush()) {
                tracing::warn!(client = client_id, "write error: {}", e);
                break;
            }
        }
        if reply.close {
            tracing::warn!(client = client_id, "closing connection after internal error");
            break;
        }
    }
}
