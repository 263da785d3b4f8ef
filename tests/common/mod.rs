//! Shared scaffolding for the end-to-end tests: an in-memory duplex pipe
//! standing in for the transport substrate (out of scope for the crate
//! itself, per its external-collaborators list), plus a small closure-backed
//! [`Dispatcher`] so each test can wire up request codes inline instead of
//! declaring a new type per scenario.

use kestrel::{DispatchError, Dispatcher, Value};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::mpsc::{Receiver, Sender, channel};

pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: VecDeque<u8>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.buf.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.buf.extend(chunk),
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.buf.pop_front().unwrap();
        }
        Ok(n)
    }
}

pub struct PipeWriter {
    tx: Sender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer end dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A connected pair of (reader, writer) ends, each writer feeding the
/// other end's reader.
pub fn duplex_pipe() -> ((PipeReader, PipeWriter), (PipeReader, PipeWriter)) {
    let (tx_a_to_b, rx_a_to_b) = channel();
    let (tx_b_to_a, rx_b_to_a) = channel();
    let a = (
        PipeReader {
            rx: rx_b_to_a,
            buf: VecDeque::new(),
        },
        PipeWriter { tx: tx_a_to_b },
    );
    let b = (
        PipeReader {
            rx: rx_a_to_b,
            buf: VecDeque::new(),
        },
        PipeWriter { tx: tx_b_to_a },
    );
    (a, b)
}

/// A [`Dispatcher`] built from a plain closure, so tests can express
/// per-code behavior as a single `match` instead of a dedicated type.
pub struct FnDispatcher<F>(pub F)
where
    F: Fn(u32, Value, &kestrel::Connection) -> Result<Value, DispatchError> + Send + Sync;

impl<F> Dispatcher for FnDispatcher<F>
where
    F: Fn(u32, Value, &kestrel::Connection) -> Result<Value, DispatchError> + Send + Sync,
{
    fn dispatch(
        &self,
        code: u32,
        args: Value,
        conn: &kestrel::Connection,
    ) -> Result<Value, DispatchError> {
        (self.0)(code, args, conn)
    }
}
