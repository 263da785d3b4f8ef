//! Value marshaler (C2): encodes arbitrary in-process values into tagged
//! payload bytes, substituting proxy references for anything that isn't a
//! plain scalar or tuple of scalars, and decodes the inverse.
//!
//! Four tag bytes open every marshaled payload, per the wire contract:
//!
//! - `s` simple immutable scalar, encoded with `facet_postcard`.
//! - `t` tuple of values, each a `(len: u32 BE, child bytes)` segment.
//! - `p` proxy introduction — one of *our* objects being exposed, or a
//!   repeat reference to one already exposed.
//! - `o` origin reference — a value that originated at the peer and is held
//!   here as a proxy.

use crate::error::{Error, Result};
use facet::Facet;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

const TAG_SCALAR: u8 = b's';
const TAG_TUPLE: u8 = b't';
const TAG_PROXY: u8 = b'p';
const TAG_ORIGIN: u8 = b'o';

/// New introduction (full descriptor) vs. a repeat reference by identity
/// alone, distinguished inside a `p`-tagged payload.
const PROXY_NEW: u8 = 1;
const PROXY_KNOWN: u8 = 0;

/// An opaque, stable handle naming an in-process object on its originating
/// peer. Derived from the data pointer of the object's `Arc`, which is
/// stable for the `Arc`'s lifetime and never reinterpreted by the peer.
pub type ObjectId = u64;

/// The supported simple, immutable scalar types. Encoded and decoded with
/// `facet_postcard`, the standard binary value codec used for the `s` tag.
#[derive(Facet, Debug, Clone, PartialEq)]
pub enum Scalar {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
    Bytes(Vec<u8>),
    Str(String),
    Slice {
        start: Option<i64>,
        stop: Option<i64>,
        step: Option<i64>,
    },
    FrozenSet(Vec<Scalar>),
}

/// A value as seen by the marshaler: either directly encodable, or an
/// object whose identity must be tracked across the connection.
pub enum Value {
    Scalar(Scalar),
    Tuple(Vec<Value>),
    /// One of our local objects, to be exposed (or already exposed) to the
    /// peer as a proxy.
    Object(Arc<dyn LocalObject>),
    /// An object that originated at the peer and is currently held here as
    /// a proxy.
    Proxy(Arc<dyn RemoteProxy>),
}

impl Clone for Value {
    fn clone(&self) -> Self {
        match self {
            Value::Scalar(s) => Value::Scalar(s.clone()),
            Value::Tuple(items) => Value::Tuple(items.clone()),
            Value::Object(o) => Value::Object(o.clone()),
            Value::Proxy(p) => Value::Proxy(p.clone()),
        }
    }
}

/// A local object capable of being exposed to the peer as a proxy.
///
/// Capability-mask computation and proxy-kind classification are external
/// collaborators (per §6) the core never inspects beyond the tag/bitmask it
/// is handed.
pub trait LocalObject: Send + Sync {
    /// Bitmask enumerating which polymorphic operations this object
    /// supports, so the peer's proxy can advertise the same capabilities.
    fn capability_mask(&self) -> u32;

    /// Which kind of proxy the peer should construct, and any constructor
    /// arguments it needs.
    fn proxy_kind(&self) -> ProxyIntroduction;

    /// Lets a dispatcher recover the concrete type behind an `o`-tagged
    /// reference it resolved back to one of its own objects.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// What to send the peer when introducing a [`LocalObject`] for the first
/// time.
pub struct ProxyIntroduction {
    pub kind: u32,
    pub args: Option<Value>,
}

/// A local stand-in for an object that originated at the peer.
pub trait RemoteProxy: Send + Sync {}

/// Constructs a local proxy from a peer's introduction.
pub trait ProxyFactory: Send + Sync {
    /// Build a proxy for `identity`/`opmask`/`kind`/`args`. Must call
    /// `register` exactly once with the constructed proxy before returning,
    /// so the marshaler can populate `proxies`/`proxy_ids` and wake anyone
    /// blocked on this identity in `pending_proxies`.
    fn create(
        &self,
        identity: ObjectId,
        opmask: u32,
        kind: u32,
        args: Option<Value>,
        register: &mut dyn FnMut(Arc<dyn RemoteProxy>),
    ) -> Arc<dyn RemoteProxy>;
}

pub(crate) fn object_identity(o: &Arc<dyn LocalObject>) -> ObjectId {
    Arc::as_ptr(o) as *const () as u64
}

pub(crate) fn proxy_identity(p: &Arc<dyn RemoteProxy>) -> ObjectId {
    Arc::as_ptr(p) as *const () as u64
}

/// One-shot wakeup used by `pending_proxies`, waited on outside the tables'
/// mutex so the thread that resolves it (by decoding the introducing
/// descriptor) never has to fight over that same lock.
struct PendingSignal {
    ready: Mutex<bool>,
    condvar: Condvar,
}

impl PendingSignal {
    fn new() -> Self {
        Self {
            ready: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn wait(&self) {
        let guard = self.ready.lock().unwrap();
        let _unused = self
            .condvar
            .wait_while(guard, |ready| !*ready)
            .unwrap();
    }

    fn signal(&self) {
        let mut guard = self.ready.lock().unwrap();
        *guard = true;
        self.condvar.notify_all();
    }
}

struct ProxyTablesInner {
    proxied_objects: HashMap<ObjectId, Arc<dyn LocalObject>>,
    proxies: HashMap<ObjectId, Arc<dyn RemoteProxy>>,
    proxy_ids: HashMap<ObjectId, ObjectId>,
    pending_proxies: HashMap<ObjectId, Arc<PendingSignal>>,
}

/// The four per-connection proxy tables, guarded by one "unmarshal mutex"
/// (§5's mutual exclusion inventory consolidates all four maps under a
/// single short-held lock; see `DESIGN.md`).
pub struct ProxyTables {
    inner: Mutex<ProxyTablesInner>,
}

impl Default for ProxyTables {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyTables {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ProxyTablesInner {
                proxied_objects: HashMap::new(),
                proxies: HashMap::new(),
                proxy_ids: HashMap::new(),
                pending_proxies: HashMap::new(),
            }),
        }
    }

    /// Resolve an `o`-tagged reference back to the local object that
    /// originated it.
    fn resolve_origin(&self, identity: ObjectId) -> Result<Arc<dyn LocalObject>> {
        let inner = self.inner.lock().unwrap();
        inner.proxied_objects.get(&identity).cloned().ok_or_else(|| {
            Error::ProtocolInvariantViolation(format!(
                "origin reference to unknown object {identity}"
            ))
        })
    }
}

/// Encode `value` as a tagged payload. May register `value` (if it is a
/// not-yet-exposed [`LocalObject`]) in `tables.proxied_objects`.
pub fn encode(value: &Value, tables: &ProxyTables) -> Result<Vec<u8>> {
    match value {
        Value::Scalar(s) => {
            let mut out = vec![TAG_SCALAR];
            out.extend(
                facet_postcard::to_vec(s)
                    .map_err(|e| Error::Marshal(format!("encoding scalar: {e:?}")))?,
            );
            Ok(out)
        }
        Value::Tuple(items) => {
            let mut out = vec![TAG_TUPLE];
            for item in items {
                let child = encode(item, tables)?;
                out.extend((child.len() as u32).to_be_bytes());
                out.extend(child);
            }
            Ok(out)
        }
        Value::Proxy(p) => {
            let proxy_id = proxy_identity(p);
            let remote_id = {
                let inner = tables.inner.lock().unwrap();
                *inner.proxy_ids.get(&proxy_id).ok_or_else(|| {
                    Error::ProtocolInvariantViolation(
                        "marshaling a proxy with no known remote identity".to_string(),
                    )
                })?
            };
            let mut out = vec![TAG_ORIGIN];
            out.extend(remote_id.to_be_bytes());
            Ok(out)
        }
        Value::Object(o) => {
            let identity = object_identity(o);
            let already_known = {
                let inner = tables.inner.lock().unwrap();
                inner.proxied_objects.contains_key(&identity)
            };
            if already_known {
                let mut out = vec![TAG_PROXY, PROXY_KNOWN];
                out.extend(identity.to_be_bytes());
                return Ok(out);
            }

            let opmask = o.capability_mask();
            let introduction = o.proxy_kind();
            {
                let mut inner = tables.inner.lock().unwrap();
                inner.proxied_objects.insert(identity, o.clone());
            }

            let mut out = vec![TAG_PROXY, PROXY_NEW];
            out.extend(identity.to_be_bytes());
            out.extend(opmask.to_be_bytes());
            out.extend(introduction.kind.to_be_bytes());
            match &introduction.args {
                None => out.push(0),
                Some(args) => {
                    out.push(1);
                    out.extend(encode(args, tables)?);
                }
            }
            Ok(out)
        }
    }
}

/// Decode a tagged payload back into a [`Value`], constructing proxies via
/// `factory` as needed and resolving the `pending_proxies` race described in
/// §4.2.
pub fn decode(bytes: &[u8], tables: &ProxyTables, factory: &dyn ProxyFactory) -> Result<Value> {
    let (&tag, rest) = bytes
        .split_first()
        .ok_or_else(|| Error::Marshal("empty payload".to_string()))?;

    match tag {
        TAG_SCALAR => {
            let scalar: Scalar = facet_postcard::from_bytes(rest)
                .map_err(|e| Error::Marshal(format!("decoding scalar: {e:?}")))?;
            Ok(Value::Scalar(scalar))
        }
        TAG_TUPLE => {
            let mut items = Vec::new();
            let mut cursor = rest;
            while !cursor.is_empty() {
                if cursor.len() < 4 {
                    return Err(Error::Marshal("truncated tuple segment length".to_string()));
                }
                let (len_bytes, after_len) = cursor.split_at(4);
                let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
                if after_len.len() < len {
                    return Err(Error::Marshal("truncated tuple segment body".to_string()));
                }
                let (child, after_child) = after_len.split_at(len);
                items.push(decode(child, tables, factory)?);
                cursor = after_child;
            }
            Ok(Value::Tuple(items))
        }
        TAG_ORIGIN => {
            if rest.len() != 8 {
                return Err(Error::Marshal("malformed origin reference".to_string()));
            }
            let identity = u64::from_be_bytes(rest.try_into().unwrap());
            let obj = tables.resolve_origin(identity)?;
            Ok(Value::Object(obj))
        }
        TAG_PROXY => decode_proxy(rest, tables, factory),
        other => Err(Error::Marshal(format!("unknown payload tag byte {other}"))),
    }
}

fn decode_proxy(rest: &[u8], tables: &ProxyTables, factory: &dyn ProxyFactory) -> Result<Value> {
    let (&form, rest) = rest
        .split_first()
        .ok_or_else(|| Error::Marshal("truncated proxy payload".to_string()))?;

    match form {
        PROXY_KNOWN => {
            if rest.len() != 8 {
                return Err(Error::Marshal("malformed known-proxy reference".to_string()));
            }
            let identity = u64::from_be_bytes(rest.try_into().unwrap());
            resolve_or_wait_for_proxy(identity, tables)
        }
        PROXY_NEW => {
            if rest.len() < 17 {
                return Err(Error::Marshal("truncated proxy introduction".to_string()));
            }
            let identity = u64::from_be_bytes(rest[0..8].try_into().unwrap());
            let opmask = u32::from_be_bytes(rest[8..12].try_into().unwrap());
            let kind = u32::from_be_bytes(rest[12..16].try_into().unwrap());
            let has_args = rest[16];
            let args = if has_args == 1 {
                Some(decode(&rest[17..], tables, factory)?)
            } else {
                None
            };

            let mut constructed: Option<Arc<dyn RemoteProxy>> = None;
            let proxy = factory.create(identity, opmask, kind, args, &mut |p| {
                constructed = Some(p);
            });
            // Some factories may call `register` with a different instance
            // than the one returned; prefer what was actually registered.
            let proxy = constructed.unwrap_or(proxy);

            let pending = {
                let mut inner = tables.inner.lock().unwrap();
                inner.proxies.insert(identity, proxy.clone());
                inner
                    .proxy_ids
                    .insert(proxy_identity(&proxy), identity);
                inner.pending_proxies.remove(&identity)
            };
            if let Some(signal) = pending {
                signal.signal();
            }

            Ok(Value::Proxy(proxy))
        }
        other => Err(Error::Marshal(format!("unknown proxy form byte {other}"))),
    }
}

fn resolve_or_wait_for_proxy(identity: ObjectId, tables: &ProxyTables) -> Result<Value> {
    loop {
        let signal = {
            let mut inner = tables.inner.lock().unwrap();
            if let Some(p) = inner.proxies.get(&identity) {
                return Ok(Value::Proxy(p.clone()));
            }
            inner
                .pending_proxies
                .entry(identity)
                .or_insert_with(|| Arc::new(PendingSignal::new()))
                .clone()
        };
        // Wait outside the tables mutex: the thread that unblocks us needs
        // to take that same mutex to insert into `proxies`.
        signal.wait();
    }
}

/// Render a decoded value as text, for turning an `exception` payload into a
/// [`crate::error::RemoteError`] message. Not part of the wire contract —
/// just a display convenience for whatever shape an exception happens to
/// take.
pub fn describe(value: &Value) -> String {
    match value {
        Value::Scalar(Scalar::Str(s)) => s.clone(),
        Value::Scalar(other) => format!("{other:?}"),
        Value::Tuple(items) => {
            let parts: Vec<String> = items.iter().map(describe).collect();
            format!("({})", parts.join(", "))
        }
        Value::Object(_) => "<local object>".to_string(),
        Value::Proxy(_) => "<remote proxy>".to_string(),
    }
}
