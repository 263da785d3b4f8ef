//! kestrel: reentrant bidirectional remote object proxying over a pair of
//! byte streams.
//!
//! Two peers exchange `request`/`response`/`exception`/`syncrequest` frames
//! (see [`frame`]) carrying marshaled values (see [`value`]) that can
//! reference objects living on either side through a stable proxy identity.
//! Responses are matched to requests strictly by arrival order per
//! connection — there is no request ID on the wire — which is what makes
//! the scheduling in [`connection`] the most delicate part of the crate:
//! any thread blocked in [`Connection::send_request`] may be asked, while it
//! waits, to step in and read frames on the stream's behalf, including a
//! nested request the peer needs serviced before it will send back the
//! reply this thread is waiting for.
//!
//! ```text
//! caller thread A -------- send_request(code, args) --------> blocks on its ResponseHandler
//!                                                                 |
//! reading thread  <----- becomes whichever thread wins ----------'
//!                        the read-arbitration predicate
//! ```
//!
//! Construct a connection with [`ConnectionBuilder`], supplying a
//! [`Dispatcher`] (what an inbound request code actually does) and a
//! [`ProxyFactory`] (how an inbound proxy introduction becomes a local
//! stand-in object).

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod registry;
pub mod value;

pub use connection::{Connection, ConnectionBuilder};
pub use dispatch::{DispatchError, Dispatcher};
pub use error::{Error, RemoteError, Result};
pub use frame::{Message, MessageKind};
pub use value::{LocalObject, ObjectId, ProxyFactory, ProxyIntroduction, ProxyTables, RemoteProxy, Scalar, Value};
