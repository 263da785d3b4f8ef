//! Dispatch glue (C5): the external dispatcher contract, and per-thread
//! request-nesting depth (used to decide whether an outbound request must
//! be rewrapped as a `syncrequest`).
//!
//! The actual `handle()` orchestration — unmarshal, invoke, marshal the
//! result, send a `response`/`exception` frame, release the processing slot
//! — lives on `connection::Connection`, since each of those steps touches
//! the scheduling state C4 owns. This module defines the seam (the
//! [`Dispatcher`] trait) and the depth bookkeeping.

use crate::connection::Connection;
use crate::error::RemoteError;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread::ThreadId;

/// What an external handler can report back to the dispatch glue.
pub enum DispatchError {
    /// An ordinary failure: marshaled and sent back as an `exception` frame.
    Failed(RemoteError),
    /// The handler wants the process to exit. The exit code is sent back as
    /// an ordinary `response` first, then re-raised locally.
    FatalExit(i32),
}

impl From<RemoteError> for DispatchError {
    fn from(e: RemoteError) -> Self {
        DispatchError::Failed(e)
    }
}

/// Maps a request's message code to whatever performs the operation
/// (evaluate, get-attribute, call, ...). Supplied externally — the core
/// only ever calls into this for plain `request`/`syncrequest` codes; it
/// handles `response`/`exception`/`syncrequest`-envelope unwrapping itself.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, code: u32, args: Value, conn: &Connection) -> Result<Value, DispatchError>;
}

/// Tracks how deeply the current thread is nested inside inbound-request
/// handling, guarded by its own lock rather than thread-local storage so
/// `Connection::close` can observe it too if needed for diagnostics.
#[derive(Default)]
pub(crate) struct ThreadDepths {
    depths: Mutex<HashMap<ThreadId, u32>>,
}

impl ThreadDepths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u32 {
        let depths = self.depths.lock().unwrap();
        *depths.get(&std::thread::current().id()).unwrap_or(&0)
    }

    /// Enter one level of request handling for the current thread; the
    /// returned guard leaves it again on drop.
    pub fn enter(&self) -> DepthGuard<'_> {
        let mut depths = self.depths.lock().unwrap();
        *depths.entry(std::thread::current().id()).or_insert(0) += 1;
        DepthGuard { depths: &self.depths }
    }
}

pub(crate) struct DepthGuard<'a> {
    depths: &'a Mutex<HashMap<ThreadId, u32>>,
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        let mut depths = self.depths.lock().unwrap();
        let id = std::thread::current().id();
        if let Some(d) = depths.get_mut(&id) {
            *d -= 1;
            if *d == 0 {
                depths.remove(&id);
            }
        }
    }
}
