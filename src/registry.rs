//! Response-handler registry (C3): one rendezvous cell per outstanding
//! outbound request, kept in an order that approximates FIFO except that a
//! nested (`syncrequest`) handler is inserted ahead of the oldest handler
//! owned by the same thread.
//!
//! The registry itself carries no lock of its own — its mutations always
//! happen while the caller already holds the scheduling mutex (see
//! `connection::Scheduler`). `ResponseHandler` carries its own lock/condvar
//! pair because it is waited on with the scheduling mutex released.

use crate::frame::Message;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

struct HandlerState {
    message: Option<Message>,
    /// Distinct from `message.is_some()`: a handler can be woken purely to
    /// re-check the read-arbitration predicate, without a message to give it.
    woken: bool,
}

/// A one-shot rendezvous cell for exactly one outstanding outbound request.
pub struct ResponseHandler {
    state: Mutex<HandlerState>,
    condvar: Condvar,
    pub thread_id: ThreadId,
    pub syncrequest: bool,
}

impl ResponseHandler {
    pub fn new(syncrequest: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HandlerState {
                message: None,
                woken: false,
            }),
            condvar: Condvar::new(),
            thread_id: std::thread::current().id(),
            syncrequest,
        })
    }

    /// Block until signaled, then return and clear whatever message (if
    /// any) was delivered. Must be called with the scheduling mutex
    /// released.
    pub fn wait(&self) -> Option<Message> {
        let guard = self.state.lock().unwrap();
        let mut guard = self.condvar.wait_while(guard, |s| !s.woken).unwrap();
        let message = guard.message.take();
        guard.woken = false;
        message
    }

    /// Peek at a message without consuming it.
    pub fn get(&self) -> Option<Message> {
        self.state.lock().unwrap().message.clone()
    }

    pub fn clear(&self) {
        let mut guard = self.state.lock().unwrap();
        guard.message = None;
        guard.woken = false;
    }

    /// Deliver `message` (or, if `None`, just wake the waiter to re-check
    /// its condition without a message to hand it).
    pub fn set(&self, message: Option<Message>) {
        let mut guard = self.state.lock().unwrap();
        if message.is_some() {
            guard.message = message;
        }
        guard.woken = true;
        self.condvar.notify_all();
    }
}

/// The ordered sequence of outstanding handlers, mutated only while the
/// scheduling mutex is held.
#[derive(Default)]
pub struct Registry {
    handlers: Vec<Arc<ResponseHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn head(&self) -> Option<&Arc<ResponseHandler>> {
        self.handlers.first()
    }

    /// Top-level outbound request: push at tail.
    pub fn append(&mut self, handler: Arc<ResponseHandler>) {
        self.handlers.push(handler);
    }

    /// Nested (`syncrequest`) outbound request: insert immediately before
    /// the first existing handler owned by the same thread, or at the tail
    /// if there is none. Must not simplify to "push front" (misroutes
    /// unrelated threads' responses) or "push back" (misroutes nested
    /// responses to the outer handler).
    pub fn insert_nested(&mut self, handler: Arc<ResponseHandler>) {
        let thread_id = handler.thread_id;
        match self.handlers.iter().position(|h| h.thread_id == thread_id) {
            Some(i) => self.handlers.insert(i, handler),
            None => self.handlers.push(handler),
        }
    }

    pub fn pop_front(&mut self) -> Option<Arc<ResponseHandler>> {
        if self.handlers.is_empty() {
            None
        } else {
            Some(self.handlers.remove(0))
        }
    }

    pub fn remove(&mut self, handler: &Arc<ResponseHandler>) {
        if let Some(i) = self.handlers.iter().position(|h| Arc::ptr_eq(h, handler)) {
            self.handlers.remove(i);
        }
    }

    /// Wake every handler, e.g. on connection close.
    pub fn set_all(&self) {
        for handler in &self.handlers {
            handler.set(None);
        }
    }
}
