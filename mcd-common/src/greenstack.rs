//! # Greenstack Framed Protocol
//!
//! Purpose: Encode and decode the length-prefixed structured protocol.
//!
//! ## Frame Layout
//!
//! ```text
//! length u32 | opaque u32 | opcode u16 | flags u8 | [status u16] |
//! flex length u32 | flex header | payload
//! ```
//!
//! `length` counts the bytes after itself. The status field is present only
//! when the response flag is set. All integers are big-endian.
//!
//! ## Design Principles
//! 1. **Raw Opcode/Status**: Messages keep the numeric fields so an unknown
//!    opcode still round-trips (the server answers it with UnknownCommand).
//! 2. **JSON Payloads**: Control payloads are serde structs defined in
//!    [`payload`]; documents use a binary meta-length prefix so values stay raw.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, ErrorClass};
use crate::frame::Frame;

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Message is a response (status field present).
pub const FLAG_RESPONSE: u8 = 0x01;
pub const FLAG_FENCE: u8 = 0x02;
pub const FLAG_MORE: u8 = 0x04;
pub const FLAG_QUIET: u8 = 0x08;

/// Largest message accepted by the decoder.
pub const MAX_MESSAGE_SIZE: usize = 30 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    Hello = 0x0001,
    SaslAuth = 0x0002,
    Noop = 0x0003,
    CreateBucket = 0x0100,
    DeleteBucket = 0x0101,
    ListBuckets = 0x0102,
    SelectBucket = 0x0103,
    Mutation = 0x0200,
    Get = 0x0201,
    Stats = 0x0300,
    AuditReload = 0x0400,
    DcpOpen = 0x0500,
    DcpStreamReq = 0x0501,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Opcode::Hello),
            0x0002 => Some(Opcode::SaslAuth),
            0x0003 => Some(Opcode::Noop),
            0x0100 => Some(Opcode::CreateBucket),
            0x0101 => Some(Opcode::DeleteBucket),
            0x0102 => Some(Opcode::ListBuckets),
            0x0103 => Some(Opcode::SelectBucket),
            0x0200 => Some(Opcode::Mutation),
            0x0201 => Some(Opcode::Get),
            0x0300 => Some(Opcode::Stats),
            0x0400 => Some(Opcode::AuditReload),
            0x0500 => Some(Opcode::DcpOpen),
            0x0501 => Some(Opcode::DcpStreamReq),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    InvalidArguments = 0x0001,
    InternalError = 0x0002,
    AuthenticationError = 0x0003,
    AuthenticationStale = 0x0004,
    NotInitialized = 0x0005,
    InvalidState = 0x0006,
    NoAccess = 0x0007,
    NotFound = 0x0008,
    UnknownCommand = 0x0009,
    UserAgentBlacklisted = 0x000a,
    NotImplemented = 0x000b,
    NoMemory = 0x000c,
    AlreadyExists = 0x000d,
    ObjectTooBig = 0x000e,
    TooBusy = 0x000f,
    IllegalRange = 0x0010,
    TmpFailure = 0x0011,
    NotMyVBucket = 0x0012,
    NotStored = 0x0013,
}

impl Status {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Status::Success),
            0x0001 => Some(Status::InvalidArguments),
            0x0002 => Some(Status::InternalError),
            0x0003 => Some(Status::AuthenticationError),
            0x0004 => Some(Status::AuthenticationStale),
            0x0005 => Some(Status::NotInitialized),
            0x0006 => Some(Status::InvalidState),
            0x0007 => Some(Status::NoAccess),
            0x0008 => Some(Status::NotFound),
            0x0009 => Some(Status::UnknownCommand),
            0x000a => Some(Status::UserAgentBlacklisted),
            0x000b => Some(Status::NotImplemented),
            0x000c => Some(Status::NoMemory),
            0x000d => Some(Status::AlreadyExists),
            0x000e => Some(Status::ObjectTooBig),
            0x000f => Some(Status::TooBusy),
            0x0010 => Some(Status::IllegalRange),
            0x0011 => Some(Status::TmpFailure),
            0x0012 => Some(Status::NotMyVBucket),
            0x0013 => Some(Status::NotStored),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Classification used by `ConnectionError` predicates.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Status::InvalidArguments => Some(ErrorClass::InvalidArguments),
            Status::AuthenticationError | Status::NoAccess => Some(ErrorClass::AccessDenied),
            Status::NotFound => Some(ErrorClass::NotFound),
            Status::AlreadyExists => Some(ErrorClass::AlreadyExists),
            Status::NotMyVBucket => Some(ErrorClass::NotMyVbucket),
            Status::NotStored => Some(ErrorClass::NotStored),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::InvalidArguments => "Invalid arguments",
            Status::InternalError => "Internal error",
            Status::AuthenticationError => "Authentication error",
            Status::AuthenticationStale => "Authentication stale",
            Status::NotInitialized => "Not initialized",
            Status::InvalidState => "Invalid state",
            Status::NoAccess => "No access",
            Status::NotFound => "Not found",
            Status::UnknownCommand => "Unknown command",
            Status::UserAgentBlacklisted => "User agent blacklisted",
            Status::NotImplemented => "Not implemented",
            Status::NoMemory => "No memory",
            Status::AlreadyExists => "Already exists",
            Status::ObjectTooBig => "Object too big",
            Status::TooBusy => "Too busy",
            Status::IllegalRange => "Illegal range",
            Status::TmpFailure => "Temporary failure",
            Status::NotMyVBucket => "Not my vbucket",
            Status::NotStored => "Not stored",
        }
    }
}

/// Flex header keys.
pub mod flex {
    pub const LANE_ID: u16 = 0x0000;
    pub const TXID: u16 = 0x0001;
    pub const PRIORITY: u16 = 0x0002;
    pub const DCP_ID: u16 = 0x0003;
    pub const VBUCKET_ID: u16 = 0x0004;
    pub const HASH: u16 = 0x0005;
    pub const TIMEOUT: u16 = 0x0006;
}

/// Ordered key/value entries carried between the fixed header and payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlexHeader {
    entries: Vec<(u16, Vec<u8>)>,
}

impl FlexHeader {
    pub fn new() -> Self {
        FlexHeader::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or replaces the entry for `key`.
    pub fn set(&mut self, key: u16, value: &[u8]) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value.to_vec(),
            None => self.entries.push((key, value.to_vec())),
        }
    }

    pub fn get(&self, key: u16) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_slice())
    }

    pub fn set_vbucket(&mut self, vbucket: u16) {
        self.set(flex::VBUCKET_ID, &vbucket.to_be_bytes());
    }

    pub fn vbucket(&self) -> Option<u16> {
        match self.get(flex::VBUCKET_ID) {
            Some([hi, lo]) => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        }
    }

    fn encoded_len(&self) -> usize {
        self.entries.iter().map(|(_, v)| 4 + v.len()).sum()
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        for (key, value) in &self.entries {
            let len = u16::try_from(value.len())
                .map_err(|_| CodecError::Malformed("flex value too long"))?;
            out.extend_from_slice(&key.to_be_bytes());
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(value);
        }
        Ok(())
    }

    fn decode(mut data: &[u8]) -> Result<Self, CodecError> {
        let mut header = FlexHeader::new();
        while !data.is_empty() {
            if data.len() < 4 {
                return Err(CodecError::Malformed("truncated flex entry"));
            }
            let key = u16::from_be_bytes([data[0], data[1]]);
            let len = u16::from_be_bytes([data[2], data[3]]) as usize;
            if data.len() < 4 + len {
                return Err(CodecError::Malformed("truncated flex value"));
            }
            header.entries.push((key, data[4..4 + len].to_vec()));
            data = &data[4 + len..];
        }
        Ok(header)
    }
}

/// One decoded message (request or response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opaque: u32,
    /// Raw opcode; see `Opcode::from_u16`.
    pub opcode: u16,
    pub flags: u8,
    /// Only meaningful when `is_response()`.
    pub status: u16,
    pub flex: FlexHeader,
    pub payload: Bytes,
}

impl Message {
    /// Creates a request message with an empty payload.
    pub fn request(opcode: Opcode) -> Self {
        Message {
            opaque: 0,
            opcode: opcode.as_u16(),
            flags: 0,
            status: 0,
            flex: FlexHeader::new(),
            payload: Bytes::new(),
        }
    }

    /// Creates a response to a request with the given raw opcode.
    pub fn response(opcode: u16, status: u16) -> Self {
        Message {
            opaque: 0,
            opcode,
            flags: FLAG_RESPONSE,
            status,
            flex: FlexHeader::new(),
            payload: Bytes::new(),
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serializes `value` as the JSON payload.
    pub fn with_json<T: Serialize>(mut self, value: &T) -> Result<Self, CodecError> {
        self.payload = Bytes::from(serde_json::to_vec(value)?);
        Ok(self)
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success.as_u16()
    }

    /// Parses the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encodes the message, replacing the contents of `frame`.
    pub fn encode(&self, frame: &mut Frame) -> Result<(), CodecError> {
        let flex_len = self.flex.encoded_len();
        let status_len = if self.is_response() { 2 } else { 0 };
        let body = 4 + 2 + 1 + status_len + 4 + flex_len + self.payload.len();
        let body_u32 =
            u32::try_from(body).map_err(|_| CodecError::Malformed("message too large"))?;

        let mut buf = Vec::with_capacity(LENGTH_PREFIX + body);
        buf.extend_from_slice(&body_u32.to_be_bytes());
        buf.extend_from_slice(&self.opaque.to_be_bytes());
        buf.extend_from_slice(&self.opcode.to_be_bytes());
        buf.push(self.flags);
        if self.is_response() {
            buf.extend_from_slice(&self.status.to_be_bytes());
        }
        buf.extend_from_slice(&(flex_len as u32).to_be_bytes());
        self.flex.encode(&mut buf)?;
        buf.extend_from_slice(&self.payload);

        frame.reset();
        frame.extend_from_slice(&buf);
        Ok(())
    }

    /// Decodes one complete message including its length prefix.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let total = frame_length(data)?;
        if data.len() < total {
            return Err(CodecError::Incomplete);
        }
        if data.len() > total {
            return Err(CodecError::Malformed("trailing bytes after message"));
        }
        let body = &data[LENGTH_PREFIX..];
        if body.len() < 7 {
            return Err(CodecError::Malformed("message shorter than fixed header"));
        }
        let opaque = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let opcode = u16::from_be_bytes([body[4], body[5]]);
        let flags = body[6];
        let mut offset = 7;

        let mut status = 0;
        if flags & FLAG_RESPONSE != 0 {
            if body.len() < offset + 2 {
                return Err(CodecError::Malformed("missing status"));
            }
            status = u16::from_be_bytes([body[offset], body[offset + 1]]);
            offset += 2;
        }

        if body.len() < offset + 4 {
            return Err(CodecError::Malformed("missing flex header length"));
        }
        let flex_len = u32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]) as usize;
        offset += 4;
        if body.len() < offset + flex_len {
            return Err(CodecError::Malformed("flex header exceeds message"));
        }
        let flex = FlexHeader::decode(&body[offset..offset + flex_len])?;
        offset += flex_len;

        Ok(Message {
            opaque,
            opcode,
            flags,
            status,
            flex,
            payload: Bytes::copy_from_slice(&body[offset..]),
        })
    }
}

/// Total size (prefix included) announced by the first four bytes.
pub fn frame_length(prefix: &[u8]) -> Result<usize, CodecError> {
    if prefix.len() < LENGTH_PREFIX {
        return Err(CodecError::Incomplete);
    }
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::Malformed("message exceeds maximum size"));
    }
    Ok(LENGTH_PREFIX + len)
}

/// Builds a document payload: meta length u32, JSON metadata, raw value.
pub fn encode_document<T: Serialize>(meta: &T, value: &[u8]) -> Result<Vec<u8>, CodecError> {
    let meta = serde_json::to_vec(meta)?;
    let meta_len =
        u32::try_from(meta.len()).map_err(|_| CodecError::Malformed("metadata too large"))?;
    let mut out = Vec::with_capacity(4 + meta.len() + value.len());
    out.extend_from_slice(&meta_len.to_be_bytes());
    out.extend_from_slice(&meta);
    out.extend_from_slice(value);
    Ok(out)
}

/// Splits a document payload and parses its metadata.
pub fn decode_document<T: DeserializeOwned>(payload: &[u8]) -> Result<(T, &[u8]), CodecError> {
    if payload.len() < 4 {
        return Err(CodecError::Malformed("document payload too short"));
    }
    let meta_len = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() < 4 + meta_len {
        return Err(CodecError::Malformed("document metadata exceeds payload"));
    }
    let meta = serde_json::from_slice(&payload[4..4 + meta_len])?;
    Ok((meta, &payload[4 + meta_len..]))
}

/// JSON payload shapes.
pub mod payload {
    use serde::{Deserialize, Serialize};

    use crate::types::{BucketType, DocumentInfo, MutationType};

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HelloRequest {
        #[serde(rename = "user-agent")]
        pub user_agent: String,
        #[serde(rename = "user-agent-version")]
        pub user_agent_version: String,
        #[serde(default)]
        pub comment: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct HelloResponse {
        pub server: String,
        pub version: String,
        #[serde(rename = "sasl-mechanisms")]
        pub sasl_mechanisms: String,
    }

    /// Challenge is base64 encoded.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SaslAuthRequest {
        pub mechanism: String,
        pub challenge: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SaslAuthResponse {
        #[serde(default)]
        pub challenge: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CreateBucketRequest {
        pub name: String,
        pub config: String,
        #[serde(rename = "type")]
        pub bucket_type: BucketType,
    }

    /// Used by DeleteBucket and SelectBucket.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct BucketName {
        pub name: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ListBucketsResponse {
        pub buckets: Vec<String>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct MutationMeta {
        #[serde(flatten)]
        pub info: DocumentInfo,
        pub operation: MutationType,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct GetRequest {
        pub id: String,
    }

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct StatsRequest {
        #[serde(default)]
        pub group: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DcpOpenRequest {
        pub name: String,
        pub flags: u32,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DcpStreamRequest {
        pub flags: u32,
        #[serde(rename = "start-seqno")]
        pub start_seqno: u64,
        #[serde(rename = "end-seqno")]
        pub end_seqno: u64,
        #[serde(rename = "vbucket-uuid")]
        pub vbucket_uuid: u64,
        #[serde(rename = "snapshot-start")]
        pub snapshot_start: u64,
        #[serde(rename = "snapshot-end")]
        pub snapshot_end: u64,
    }
}
