//! Command dispatch
//!
//! One worker thread owns the `SessionStore`. Connection threads submit
//! parsed commands over a channel and wait for the reply, so commands from
//! all clients run one at a time, each to completion, and every transaction
//! begins and ends inside a single dispatch step.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::error::{Result, StoreError};
use crate::protocol::{restore_response, session_record, Command, GROUP_NOT_FOUND};
use crate::session::SessionStore;

/// Result of one command, as seen by the connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    /// Bytes to write back, if the command has a reply
    pub response: Option<Vec<u8>>,
    /// Close this connection (internal invariant violation)
    pub close: bool,
}

impl Reply {
    fn silent() -> Self {
        Self::default()
    }

    fn bytes(response: Vec<u8>) -> Self {
        Self { response: Some(response), close: false }
    }
}

/// Execute one command against the store and build the wire reply.
///
/// Failures are logged; only `restore` ever produces bytes.
pub fn execute(store: &mut SessionStore, command: &Command) -> Reply {
    match command {
        Command::New => {
            tracing::info!("starting new session");
            let result = store.create();
            if result.is_ok() {
                tracing::info!(root = ?store.root(), "stored pointer");
            }
            failure(command, result)
        }
        Command::Store(payload) => {
            tracing::debug!(payload = %String::from_utf8_lossy(payload), "received");
            let result = store.update(&session_record(payload));
            if result.is_ok() {
                tracing::debug!(len = payload.len(), "stored");
            }
            failure(command, result)
        }
        Command::Restore => match store.restore() {
            Ok(Some(session)) => {
                let response = restore_response(session);
                tracing::info!(len = response.len(), "restore: sending session");
                Reply::bytes(response)
            }
            Ok(None) => {
                tracing::warn!("couldn't restore group session as there was no session loaded");
                Reply::bytes(GROUP_NOT_FOUND.to_vec())
            }
            Err(e) => {
                // An unreadable session reads as absent on the wire
                tracing::warn!(code = e.code(), "restore failed: {}", e);
                Reply::bytes(GROUP_NOT_FOUND.to_vec())
            }
        },
        Command::Remove => {
            tracing::info!("removing session");
            let result = store.remove();
            if result.is_ok() {
                tracing::info!(root = ?store.root(), "stored pointer");
            }
            failure(command, result)
        }
        Command::Unknown(keyword) => {
            tracing::warn!(keyword = %keyword, "invalid command received");
            Reply::silent()
        }
    }
}

fn failure(command: &Command, result: Result<()>) -> Reply {
    match result {
        Ok(()) => Reply::silent(),
        Err(e) => {
            tracing::warn!(command = command.name(), code = e.code(), "command failed: {}", e);
            Reply {
                response: None,
                close: e.is_fatal_for_connection(),
            }
        }
    }
}

enum Job {
    Command { command: Command, reply: Sender<Reply> },
    Shutdown { done: Sender<Result<()>> },
}

/// Owner of the dispatcher thread.
pub struct Dispatcher {
    jobs: Sender<Job>,
    worker: Option<JoinHandle<()>>,
}

/// Cloneable submission handle given to connection threads.
#[derive(Clone)]
pub struct DispatchHandle {
    jobs: Sender<Job>,
}

impl Dispatcher {
    pub fn spawn(store: SessionStore) -> std::io::Result<Self> {
        let (jobs, rx) = unbounded();
        let worker = thread::Builder::new()
            .name("groupd-dispatch".into())
            .spawn(move || run_worker(store, rx))?;
        Ok(Self { jobs, worker: Some(worker) })
    }

    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle { jobs: self.jobs.clone() }
    }

    /// Let queued commands finish, flush the store and stop the worker.
    ///
    /// Waits at most `grace` for the worker to acknowledge.
    pub fn shutdown(mut self, grace: Duration) -> Result<()> {
        let (done, ack) = bounded(1);
        if self.jobs.send(Job::Shutdown { done }).is_err() {
            return Ok(()); // worker already gone
        }
        let result = match ack.recv_timeout(grace) {
            Ok(result) => result,
            Err(_) => Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dispatcher did not finish within the shutdown grace period",
            ))),
        };
        if result.is_ok() {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
        result
    }
}

impl DispatchHandle {
    /// Run `command` on the dispatcher thread. None once the dispatcher stopped.
    pub fn submit(&self, command: Command) -> Option<Reply> {
        let (reply, rx) = bounded(1);
        self.jobs.send(Job::Command { command, reply }).ok()?;
        rx.recv().ok()
    }
}

fn run_worker(mut store: SessionStore, jobs: Receiver<Job>) {
    for job in jobs.iter() {
        match job {
            Job::Command { command, reply } => {
                let outcome = execute(&mut store, &command);
                // Client may have disconnected while waiting
                let _ = reply.send(outcome);
            }
            Job::Shutdown { done } => {
                let result = store.flush();
                match &result {
                    Ok(()) => tracing::info!("session store flushed"),
                    Err(e) => tracing::warn!("flush on shutdown failed: {}", e),
                }
                let _ = done.send(result);
                break;
            }
        }
    }
}
