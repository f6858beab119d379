//! # McdConn Client
//!
//! Purpose: Talk to a memcached-style server over either the legacy binary
//! protocol or Greenstack, on plain or TLS sockets, behind one connection
//! contract.
//!
//! ## Design Principles
//! 1. **One Contract, Two Protocols**: `MemcachedConnection` is implemented by
//!    `BinprotConnection` and `GreenstackConnection`; callers hold `dyn` handles.
//! 2. **Owned Transport**: Each connection owns its socket (and TLS session);
//!    acquired in `connect`, released in `close` or on drop.
//! 3. **Classified Failures**: Server rejections surface as `ConnectionError`
//!    with predicates; everything else is a generic `ClientError`.
//! 4. **Blocking I/O**: Calls block until a full response arrives; socket
//!    timeouts come from `ConnectionOptions`.

mod binprot;
mod config;
mod connection;
mod error;
mod greenstack;
mod map;
pub mod tls;
mod transport;

pub use binprot::BinprotConnection;
pub use config::ConnectionOptions;
pub use connection::{new_connection, ConnectionCore, ConnectionState, MemcachedConnection};
pub use error::{ClientError, ClientResult};
pub use greenstack::GreenstackConnection;
pub use map::ConnectionMap;

pub use mcd_common::{
    AddressFamily, BucketType, Compression, ConnectionError, Datatype, Document, DocumentInfo,
    EwbEngineMode, Frame, MutationInfo, MutationType, PortDescriptor, PortEntry, Protocol,
    TransportKind,
};
