//! Connection-level building blocks.
//!
//! - [`Listener`] / [`Stream`]: TCP and Unix domain sockets behind one type
//! - [`ConnectionRecord`]: recyclable per-socket state of the readiness loop
//! - `HttpConnection`: a connection served on the tokio engine
//! - [`Slab`] / [`FreeList`]: index-addressed record storage and record reuse
//! - [`ConnectionId`] / [`PeerAddr`]: identity of a connection in logs and
//!   in the request descriptor

mod http_connection;
mod record;
mod slab;
mod socket;

pub(crate) use http_connection::HttpConnection;
pub use record::{ConnectionId, ConnectionRecord};
pub use slab::{FreeList, Slab};
pub use socket::{Listener, LocalAddr, PeerAddr, Stream};
