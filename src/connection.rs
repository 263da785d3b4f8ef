//! Reentrant request/response coordinator (C4) — the heart of the crate.
//!
//! A single background thread (or the caller of [`Connection::serve_forever`])
//! owns the read side of the stream at any moment; every other thread that
//! calls [`Connection::send_request`] either reads on its own behalf (if it
//! manages to become the one permitted to read) or blocks on its own
//! [`ResponseHandler`] until the reading thread delivers its reply. This is a
//! direct translation of `pushy`'s `BaseConnection` scheduling algorithm from
//! a GIL-protected `threading.Condition` to `std::sync::{Mutex, Condvar}`.

use crate::dispatch::{DispatchError, Dispatcher, ThreadDepths};
use crate::error::{Error, Result};
use crate::frame::{self, Message, MessageKind};
use crate::registry::{Registry, ResponseHandler};
use crate::value::{self, ProxyFactory, ProxyTables, Scalar, Value};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Condvar, Mutex};

/// The mutable scheduling state, guarded by one mutex and signaled through
/// one condvar. Every field here corresponds to a name used in §5 of the
/// component's design: `open`, `receiving`, `processing`, `waiting`,
/// `responses`, the pending-inbound-`request` queue, and the ordered
/// response-handler registry.
struct SchedulerState {
    open: bool,
    /// True while some thread is blocked inside the actual stream read.
    receiving: bool,
    /// Number of inbound requests/syncrequests currently being serviced
    /// (dispatched but not yet responded to).
    processing: u32,
    /// Of `processing`, how many belong to threads that are themselves
    /// blocked inside `send_request` waiting for their own reply.
    waiting: u32,
    /// Of `processing`, how many are `response`/`exception` frames already
    /// read and delivered but not yet fully handled. (Kept for parity with
    /// the "two different things named processing" hazard the component
    /// calls out; here it doubles as a read-arbitration signal only.)
    responses: u32,
    /// Top-level inbound `request` frames read before their recipient
    /// thread could claim them, waiting to be claimed by a later call to
    /// `wait_for_request`.
    requests: VecDeque<Message>,
    registry: Registry,
}

struct Scheduler {
    state: Mutex<SchedulerState>,
    condvar: Condvar,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                open: true,
                receiving: false,
                processing: 0,
                waiting: 0,
                responses: 0,
                requests: VecDeque::new(),
                registry: Registry::new(),
            }),
            condvar: Condvar::new(),
        }
    }
}

/// Builds a [`Connection`] from its four external collaborators plus the
/// byte-stream pair, using a builder rather than constructor positional args
/// for connection-scoped configuration.
pub struct ConnectionBuilder {
    initiator: bool,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    proxy_factory: Option<Arc<dyn ProxyFactory>>,
}

impl Default for ConnectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionBuilder {
    pub fn new() -> Self {
        Self {
            initiator: false,
            dispatcher: None,
            proxy_factory: None,
        }
    }

    /// Whether this side opened the underlying transport (affects nothing
    /// in the scheduling algorithm itself; recorded for diagnostics and for
    /// collaborators that care which side they're on).
    pub fn initiator(mut self, initiator: bool) -> Self {
        self.initiator = initiator;
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn proxy_factory(mut self, proxy_factory: Arc<dyn ProxyFactory>) -> Self {
        self.proxy_factory = Some(proxy_factory);
        self
    }

    pub fn build<R, W>(self, reader: R, writer: W) -> Result<Connection>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| Error::Marshal("ConnectionBuilder missing dispatcher".to_string()))?;
        let proxy_factory = self.proxy_factory.ok_or_else(|| {
            Error::Marshal("ConnectionBuilder missing proxy_factory".to_string())
        })?;

        tracing::info!(initiator = self.initiator, pid = std::process::id(), "connection established");

        Ok(Connection {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            request_mutex: Mutex::new(()),
            scheduler: Scheduler::new(),
            tables: ProxyTables::new(),
            depths: ThreadDepths::new(),
            dispatcher,
            proxy_factory,
            pid: std::process::id(),
            initiator: self.initiator,
        })
    }
}

/// One bidirectional, reentrant connection over a pair of byte streams.
pub struct Connection {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    /// Serializes `send_request` callers so that building the outbound frame
    /// and registering its response handler happens as one atomic step from
    /// the wire's point of view (mirrors `pushy`'s per-connection request
    /// lock, distinct from the scheduling mutex).
    request_mutex: Mutex<()>,
    scheduler: Scheduler,
    tables: ProxyTables,
    depths: ThreadDepths,
    dispatcher: Arc<dyn Dispatcher>,
    proxy_factory: Arc<dyn ProxyFactory>,
    pid: u32,
    initiator: bool,
}

impl Connection {
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn proxy_tables(&self) -> &ProxyTables {
        &self.tables
    }

    fn is_open(&self) -> bool {
        self.scheduler.state.lock().unwrap().open
    }

    fn check_pid(&self) -> Result<()> {
        if std::process::id() != self.pid {
            return Err(Error::ProtocolInvariantViolation(
                "process id changed under an open connection (fork?)".to_string(),
            ));
        }
        Ok(())
    }

    /// Read one frame, tearing the connection down on any transport failure
    /// so every other blocked thread observes the close rather than hanging.
    fn recv_one(&self) -> Result<Message> {
        let mut guard = self.reader.lock().unwrap();
        let reader = guard
            .as_mut()
            .ok_or(Error::ConnectionClosed)?;
        match frame::unpack(reader) {
            Ok(m) => Ok(m),
            Err(e) => {
                drop(guard);
                tracing::warn!(error = %e, "transport read failed, closing connection");
                self.force_close();
                Err(e)
            }
        }
    }

    fn send_frame(&self, kind: MessageKind, payload: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().unwrap();
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        match frame::write_frame(writer, kind, payload) {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                tracing::warn!(error = %e, "transport write failed, closing connection");
                self.force_close();
                Err(e)
            }
        }
    }

    /// Run `f` with `receiving` set for its duration, regardless of whether
    /// it succeeds — so a read failure can never leave the flag stuck.
    fn with_receiving<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        {
            let mut state = self.scheduler.state.lock().unwrap();
            state.receiving = true;
        }
        let result = f();
        {
            let mut state = self.scheduler.state.lock().unwrap();
            state.receiving = false;
            self.scheduler.condvar.notify_all();
        }
        result
    }

    fn force_close(&self) {
        let mut state = self.scheduler.state.lock().unwrap();
        if !state.open {
            return;
        }
        state.open = false;
        state.registry.set_all();
        self.scheduler.condvar.notify_all();
    }

    /// Read and claim one message this thread should treat as a request to
    /// handle (a top-level `request`), or `None` if either the connection
    /// just closed, or the frame that was read belongs to someone else's
    /// response handler (in which case the caller's `serve_forever` loop
    /// simply tries again).
    fn wait_for_request(&self) -> Result<Option<Message>> {
        let mut state = self.scheduler.state.lock().unwrap();
        loop {
            if !state.open {
                return Ok(None);
            }
            if !state.requests.is_empty() {
                break;
            }
            let blocked = state.receiving
                || state.responses > 0
                || (state.processing > 0 && state.processing > state.waiting);
            if !blocked {
                break;
            }
            state = self.scheduler.condvar.wait(state).unwrap();
        }

        if !state.open {
            return Ok(None);
        }

        if let Some(request) = state.requests.pop_front() {
            state.processing += 1;
            if let Some(head) = state.registry.head().cloned() {
                head.set(None);
            }
            return Ok(Some(request));
        }

        drop(state);

        let msg = self.with_receiving(|| self.recv_one())?;

        let mut state = self.scheduler.state.lock().unwrap();
        let result = match msg.kind {
            MessageKind::Response | MessageKind::Exception => {
                state.responses += 1;
                if let Some(head) = state.registry.head().cloned() {
                    head.set(Some(msg));
                }
                None
            }
            MessageKind::SyncRequest => {
                state.processing += 1;
                if let Some(head) = state.registry.head().cloned() {
                    head.set(Some(msg));
                }
                None
            }
            MessageKind::Request(_) => {
                if state.open {
                    state.processing += 1;
                }
                if let Some(head) = state.registry.head().cloned() {
                    head.set(None);
                }
                Some(msg)
            }
        };
        self.scheduler.condvar.notify_all();
        Ok(result)
    }

    /// Block until `handler` has a message, becoming the reading thread
    /// ourselves if we're allowed to and nobody else beats us to it.
    fn wait_for_response(&self, handler: &Arc<ResponseHandler>) -> Result<Message> {
        let mut state = self.scheduler.state.lock().unwrap();
        let mut message = handler.get();
        if message.is_some() {
            handler.clear();
        }

        loop {
            if !state.open || message.is_some() {
                break;
            }
            let is_head = state
                .registry
                .head()
                .map(|h| Arc::ptr_eq(h, handler))
                .unwrap_or(false);
            let blocked = state.receiving
                || !is_head
                || (state.processing > 0 && state.processing > state.waiting);
            if !blocked {
                break;
            }
            if !is_head {
                if let Some(head) = state.registry.head().cloned() {
                    head.set(None);
                }
            }
            drop(state);
            message = handler.wait();
            state = self.scheduler.state.lock().unwrap();
        }

        if message.is_none() && state.open {
            drop(state);
            let received = self.with_receiving(|| loop {
                let msg = self.recv_one()?;
                if matches!(
                    msg.kind,
                    MessageKind::Response | MessageKind::Exception | MessageKind::SyncRequest
                ) {
                    return Ok(msg);
                }
                let mut s = self.scheduler.state.lock().unwrap();
                s.requests.push_back(msg);
                self.scheduler.condvar.notify_all();
            })?;

            state = self.scheduler.state.lock().unwrap();
            match received.kind {
                MessageKind::Response | MessageKind::Exception => {
                    state.registry.pop_front();
                }
                MessageKind::SyncRequest => {
                    state.processing += 1;
                }
                MessageKind::Request(_) => unreachable!("filtered out above"),
            }
            message = Some(received);
        } else if state.open {
            if let Some(msg) = &message {
                if matches!(msg.kind, MessageKind::Response | MessageKind::Exception) {
                    state.registry.pop_front();
                    state.responses -= 1;
                }
            }
        }

        if handler.syncrequest {
            state.waiting -= 1;
        }

        let outcome = if !state.open && message.is_none() {
            state.registry.remove(handler);
            Err(Error::ConnectionClosed)
        } else {
            Ok(message.expect("message present whenever connection is still open"))
        };

        self.scheduler.condvar.notify_all();
        outcome
    }

    /// Unmarshal, invoke the external dispatcher, marshal the result, and —
    /// for anything request-like — send the reply frame and release the
    /// processing slot. Used uniformly for inbound `request`/`syncrequest`
    /// frames and for the final `response`/`exception` a `send_request` call
    /// waited for.
    fn handle(&self, msg: Message) -> Result<Value> {
        let is_request_like = msg.kind.is_request_like();
        let _depth_guard = is_request_like.then(|| self.depths.enter());

        let outcome = self.dispatch_message(&msg);

        if is_request_like {
            self.finish_request(&outcome)?;
        }

        outcome
    }

    fn dispatch_message(&self, msg: &Message) -> Result<Value> {
        match msg.kind {
            MessageKind::Response => {
                value::decode(&msg.payload, &self.tables, self.proxy_factory.as_ref())
            }
            MessageKind::Exception => {
                let value = value::decode(&msg.payload, &self.tables, self.proxy_factory.as_ref())?;
                Err(Error::RemoteException(crate::error::RemoteError::new(
                    value::describe(&value),
                )))
            }
            MessageKind::SyncRequest => {
                if msg.payload.len() < 4 {
                    return Err(Error::Marshal(
                        "truncated syncrequest envelope".to_string(),
                    ));
                }
                let code = u32::from_be_bytes(msg.payload[0..4].try_into().unwrap());
                let args = value::decode(
                    &msg.payload[4..],
                    &self.tables,
                    self.proxy_factory.as_ref(),
                )?;
                self.dispatch_request(code, args)
            }
            MessageKind::Request(code) => {
                let args = value::decode(&msg.payload, &self.tables, self.proxy_factory.as_ref())?;
                self.dispatch_request(code, args)
            }
        }
    }

    fn dispatch_request(&self, code: u32, args: Value) -> Result<Value> {
        match self.dispatcher.dispatch(code, args, self) {
            Ok(v) => Ok(v),
            Err(DispatchError::Failed(e)) => Err(Error::RemoteException(e)),
            Err(DispatchError::FatalExit(exit_code)) => Err(Error::FatalExit(exit_code)),
        }
    }

    fn finish_request(&self, outcome: &Result<Value>) -> Result<()> {
        let (kind, payload) = match outcome {
            Ok(value) => (MessageKind::Response, value::encode(value, &self.tables)?),
            Err(Error::FatalExit(code)) => (
                MessageKind::Response,
                value::encode(&Value::Scalar(Scalar::Int(*code as i64)), &self.tables)?,
            ),
            Err(other) => (
                MessageKind::Exception,
                value::encode(&Value::Scalar(Scalar::Str(other.to_string())), &self.tables)?,
            ),
        };

        let mut state = self.scheduler.state.lock().unwrap();
        state.processing -= 1;
        self.scheduler.condvar.notify_all();
        drop(state);

        self.send_frame(kind, &payload)
    }

    /// Drive the read loop: repeatedly claim an inbound top-level request
    /// and handle it, until the connection closes. Returns `Ok(())` on a
    /// graceful close (including one triggered by a transport failure); a
    /// `FatalExit` raised by a handler propagates out of this call after the
    /// corresponding reply has been sent.
    pub fn serve_forever(&self) -> Result<()> {
        loop {
            self.check_pid()?;
            if !self.is_open() {
                return Ok(());
            }
            match self.wait_for_request() {
                Ok(Some(msg)) => match self.handle(msg) {
                    Err(Error::FatalExit(code)) => return Err(Error::FatalExit(code)),
                    _ => {}
                },
                Ok(None) => continue,
                Err(Error::Transport(_)) | Err(Error::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a request for `code`/`args` and block for the reply, servicing
    /// any nested `syncrequest`s the peer sends back in the meantime.
    /// Automatically wraps the outbound frame as a `syncrequest` if this
    /// thread is itself already inside inbound-request handling.
    pub fn send_request(&self, code: u32, args: Value) -> Result<Value> {
        self.check_pid()?;
        let _request_guard = self.request_mutex.lock().unwrap();

        {
            let state = self.scheduler.state.lock().unwrap();
            if !state.open {
                return Err(Error::ConnectionClosed);
            }
        }

        let nested = self.depths.current() > 0;
        let args_payload = value::encode(&args, &self.tables)?;
        let (kind, payload) = if nested {
            let mut buf = Vec::with_capacity(4 + args_payload.len());
            buf.extend(code.to_be_bytes());
            buf.extend(args_payload);
            (MessageKind::SyncRequest, buf)
        } else {
            (MessageKind::Request(code), args_payload)
        };

        let handler = ResponseHandler::new(nested);
        {
            let mut state = self.scheduler.state.lock().unwrap();
            if nested {
                state.waiting += 1;
                if state.processing == state.waiting {
                    self.scheduler.condvar.notify_all();
                }
                state.registry.insert_nested(handler.clone());
            } else {
                state.registry.append(handler.clone());
            }
        }

        self.send_frame(kind, &payload)?;
        drop(_request_guard);

        loop {
            let msg = self.wait_for_response(&handler)?;
            if msg.kind == MessageKind::SyncRequest {
                if let Err(Error::FatalExit(exit_code)) = self.handle(msg) {
                    return Err(Error::FatalExit(exit_code));
                }
                continue;
            }
            return self.handle(msg);
        }
    }

    /// Close the connection: stop accepting new outbound requests, wake
    /// every waiter with a `ConnectionClosed` error, wait for in-flight
    /// handling to drain, then close both streams exactly once.
    pub fn close(&self) -> Result<()> {
        let _request_guard = self.request_mutex.lock().unwrap();
        let mut state = self.scheduler.state.lock().unwrap();
        if !state.open {
            return Ok(());
        }
        state.open = false;
        state.registry.set_all();
        self.scheduler.condvar.notify_all();

        while !state.registry.is_empty() || state.processing > 0 {
            state = self.scheduler.condvar.wait(state).unwrap();
        }
        drop(state);

        self.reader.lock().unwrap().take();
        self.writer.lock().unwrap().take();

        tracing::info!(pid = self.pid, "connection closed");
        Ok(())
    }
}
