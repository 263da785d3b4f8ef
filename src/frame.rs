//! Frame codec (C1): packs and unpacks typed messages on a byte stream.
//!
//! # Wire format
//!
//! Each frame is a fixed header followed by exactly `len` payload bytes:
//!
//! ```text
//! [tag: u8][code: u32 BE, only present when tag == REQUEST][len: u32 BE][payload: len bytes]
//! ```
//!
//! `tag` distinguishes the four logical message types. `code` (request
//! frames only) identifies which request subtype this is (evaluate,
//! get-attribute, call, ...); the core treats it as an opaque `u32` handed
//! to the external dispatcher. `response`/`exception`/`syncrequest` carry no
//! code of their own — the core handles those three itself.
//!
//! Responses are matched to requests by FIFO order (see [`crate::registry`]),
//! not by an ID carried on the wire.

use crate::error::{Error, Result};
use std::io::{Read, Write};

const TAG_RESPONSE: u8 = 0;
const TAG_EXCEPTION: u8 = 1;
const TAG_SYNCREQUEST: u8 = 2;
const TAG_REQUEST: u8 = 3;

/// The logical type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// A request for one of the externally-dispatched operations, identified
    /// by `code`.
    Request(u32),
    /// A reply to an earlier request.
    Response,
    /// A reply carrying a marshaled error instead of a result.
    Exception,
    /// A request issued by a thread that is itself inside inbound-request
    /// handling; the peer must be willing to service it while blocked
    /// awaiting its own reply (see `connection::Connection::send_request`).
    SyncRequest,
}

impl MessageKind {
    /// True for anything the dispatcher must treat as "a request to handle",
    /// as opposed to a reply.
    pub fn is_request_like(self) -> bool {
        matches!(self, MessageKind::Request(_) | MessageKind::SyncRequest)
    }
}

/// A frame read from, or to be written to, the stream.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Encode `kind`/`payload` as a complete frame, ready to write to the stream.
pub fn pack(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + payload.len());
    match kind {
        MessageKind::Response => buf.push(TAG_RESPONSE),
        MessageKind::Exception => buf.push(TAG_EXCEPTION),
        MessageKind::SyncRequest => buf.push(TAG_SYNCREQUEST),
        MessageKind::Request(code) => {
            buf.push(TAG_REQUEST);
            buf.extend_from_slice(&code.to_be_bytes());
        }
    }
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Write a frame to `w` and flush it, so the peer is guaranteed to see it.
pub fn write_frame<W: Write>(w: &mut W, kind: MessageKind, payload: &[u8]) -> Result<()> {
    let bytes = pack(kind, payload);
    w.write_all(&bytes)?;
    w.flush()?;
    Ok(())
}

/// Read exactly one frame from `r`, blocking until it is fully available.
pub fn unpack<R: Read>(r: &mut R) -> Result<Message> {
    let mut tag_buf = [0u8; 1];
    read_exact_or_transport(r, &mut tag_buf, "reading frame tag")?;

    let kind = match tag_buf[0] {
        TAG_RESPONSE => MessageKind::Response,
        TAG_EXCEPTION => MessageKind::Exception,
        TAG_SYNCREQUEST => MessageKind::SyncRequest,
        TAG_REQUEST => {
            let mut code_buf = [0u8; 4];
            read_exact_or_transport(r, &mut code_buf, "reading frame code")?;
            MessageKind::Request(u32::from_be_bytes(code_buf))
        }
        other => {
            return Err(Error::Transport(format!("unknown frame tag byte {other}")));
        }
    };

    let mut len_buf = [0u8; 4];
    read_exact_or_transport(r, &mut len_buf, "reading frame length")?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    read_exact_or_transport(r, &mut payload, "reading frame payload")?;

    Ok(Message { kind, payload })
}

fn read_exact_or_transport<R: Read>(r: &mut R, buf: &mut [u8], ctx: &str) -> Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Transport(format!("stream ended mid-frame while {ctx}"))
        } else {
            Error::Io(e)
        }
    })
}
