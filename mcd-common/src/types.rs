//! # Connection and Document Types
//!
//! Tags that select a connection flavour (protocol, address family, TLS) and
//! the value objects exchanged with the server (documents and mutation results).
//!
//! ## Design Principles
//!
//! 1. **Plain Values**: Every type here is owned data with no back-references
//!    to a connection; callers keep documents after a call returns.
//! 2. **Serde at the Edges**: Tags serialize with the spellings used by the
//!    server port file and the Greenstack JSON payloads.
//! 3. **Opaque CAS**: The CAS is carried verbatim and never interpreted.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Wire protocol spoken by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Legacy memcached binary protocol (fixed 24 byte header).
    Memcached,
    /// Length-prefixed structured frame protocol.
    Greenstack,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Memcached => write!(f, "Memcached"),
            Protocol::Greenstack => write!(f, "Greenstack"),
        }
    }
}

/// Socket address family used when resolving the target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "AF_INET")]
    Inet,
    #[serde(rename = "AF_INET6")]
    Inet6,
    /// Pick whichever address resolves first.
    #[serde(rename = "AF_UNSPEC")]
    Unspecified,
}

impl AddressFamily {
    /// Returns true if `addr` belongs to this family.
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            AddressFamily::Inet => addr.is_ipv4(),
            AddressFamily::Inet6 => addr.is_ipv6(),
            AddressFamily::Unspecified => true,
        }
    }

    /// Loopback host used when no explicit host is configured.
    pub fn loopback(&self) -> &'static str {
        match self {
            AddressFamily::Inet6 => "::1",
            _ => "127.0.0.1",
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => write!(f, "AF_INET"),
            AddressFamily::Inet6 => write!(f, "AF_INET6"),
            AddressFamily::Unspecified => write!(f, "AF_UNSPEC"),
        }
    }
}

/// Transport label combining TLS and address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Plain,
    Ssl,
    PlainIpv6,
    SslIpv6,
}

impl TransportKind {
    pub fn new(ssl: bool, family: AddressFamily) -> Self {
        match (ssl, family) {
            (false, AddressFamily::Inet6) => TransportKind::PlainIpv6,
            (true, AddressFamily::Inet6) => TransportKind::SslIpv6,
            (false, _) => TransportKind::Plain,
            (true, _) => TransportKind::Ssl,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Plain => write!(f, "Plain"),
            TransportKind::Ssl => write!(f, "SSL"),
            TransportKind::PlainIpv6 => write!(f, "PlainIpv6"),
            TransportKind::SslIpv6 => write!(f, "SslIpv6"),
        }
    }
}

/// Kind of bucket to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    Memcached,
    Couchbase,
    #[serde(rename = "ewouldblock")]
    EWouldBlock,
}

/// Mutation semantics applied by `mutate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationType {
    /// Store only if the key does not exist.
    Add,
    /// Store unconditionally (subject to CAS).
    Set,
    /// Store only if the key exists.
    Replace,
    /// Append to an existing value.
    Append,
    /// Prepend to an existing value.
    Prepend,
    /// Remove the document.
    Delete,
}

/// Compression applied to a document value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Snappy,
}

/// Datatype tag of a document value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    #[default]
    Raw,
    Json,
}

/// Metadata describing a stored document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    /// Document identifier (key).
    pub id: String,
    /// Opaque user flags.
    pub flags: u32,
    /// Expiration; empty means never, otherwise seconds as decimal text.
    pub expiration: String,
    pub compression: Compression,
    pub datatype: Datatype,
    /// Opaque version token; 0 means "no CAS precondition" on mutation.
    pub cas: u64,
}

/// A document: metadata plus raw value bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub info: DocumentInfo,
    pub value: Vec<u8>,
}

impl Document {
    /// Creates a raw document with default metadata.
    pub fn new(id: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Document {
            info: DocumentInfo {
                id: id.into(),
                ..DocumentInfo::default()
            },
            value: value.into(),
        }
    }
}

/// Outcome of a successful mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationInfo {
    /// New CAS assigned by the server.
    pub cas: u64,
    /// Number of value bytes sent.
    pub size: usize,
    /// Sequence number (0 when the server did not report one).
    pub seqno: u64,
    /// vbucket UUID (0 when the server did not report one).
    #[serde(rename = "vbucketuuid")]
    pub vbucket_uuid: u64,
}

/// Modes understood by the ewouldblock test engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EwbEngineMode {
    /// Inject the error for the next N calls.
    NextN = 0,
    /// Inject the error randomly.
    Random = 1,
    /// Inject the error on the first call only.
    First = 2,
    /// Inject according to a bit sequence.
    Sequence = 3,
    /// Return EWOULDBLOCK without notifying.
    NoNotify = 4,
    /// Simulate CAS mismatch.
    CasMismatch = 5,
}
