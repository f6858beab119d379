//! # Memcached Binary Protocol
//!
//! Purpose: Encode and decode the fixed 24 byte header protocol, both the
//! request side (used by the client) and the response side (used by the mock
//! server and the client decoder).
//!
//! ## Memory Layout
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!   +---------------+---------------+---------------+---------------+
//!  0| Magic         | Opcode        | Key length                    |
//!   +---------------+---------------+---------------+---------------+
//!  4| Extras length | Data type     | vbucket id / status           |
//!   +---------------+---------------+---------------+---------------+
//!  8| Total body length                                             |
//!   +---------------+---------------+---------------+---------------+
//! 12| Opaque                                                        |
//!   +---------------+---------------+---------------+---------------+
//! 16| CAS                                                           |
//!   |                                                               |
//!   +---------------+---------------+---------------+---------------+
//! 24| extras | key | value                                          |
//! ```
//!
//! All integers are big-endian.

use bytes::Bytes;

use crate::error::{CodecError, ErrorClass};
use crate::frame::Frame;
use crate::types::BucketType;

/// Magic byte for request packets.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte for response packets.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Size of the fixed header.
pub const HEADER_SIZE: usize = 24;

/// Datatype bit: value is JSON.
pub const DATATYPE_JSON: u8 = 0x01;

/// Datatype bit: value is Snappy compressed.
pub const DATATYPE_SNAPPY: u8 = 0x02;

/// DCP_OPEN flag requesting a producer stream.
pub const DCP_OPEN_PRODUCER: u32 = 0x01;

/// Largest frame (header included) accepted by the decoder.
pub const MAX_FRAME_SIZE: usize = 20 * 1024 * 1024;

/// Binary protocol opcodes used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    IoctlGet = 0x23,
    IoctlSet = 0x24,
    AuditConfigReload = 0x28,
    DcpOpen = 0x50,
    DcpStreamReq = 0x53,
    CreateBucket = 0x85,
    DeleteBucket = 0x86,
    ListBuckets = 0x87,
    SelectBucket = 0x89,
    EwouldblockCtl = 0xeb,
}

impl Opcode {
    /// Try to convert a byte to an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x0a => Some(Opcode::Noop),
            0x0e => Some(Opcode::Append),
            0x0f => Some(Opcode::Prepend),
            0x10 => Some(Opcode::Stat),
            0x1f => Some(Opcode::Hello),
            0x20 => Some(Opcode::SaslListMechs),
            0x21 => Some(Opcode::SaslAuth),
            0x22 => Some(Opcode::SaslStep),
            0x23 => Some(Opcode::IoctlGet),
            0x24 => Some(Opcode::IoctlSet),
            0x28 => Some(Opcode::AuditConfigReload),
            0x50 => Some(Opcode::DcpOpen),
            0x53 => Some(Opcode::DcpStreamReq),
            0x85 => Some(Opcode::CreateBucket),
            0x86 => Some(Opcode::DeleteBucket),
            0x87 => Some(Opcode::ListBuckets),
            0x89 => Some(Opcode::SelectBucket),
            0xeb => Some(Opcode::EwouldblockCtl),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    TooBig = 0x0003,
    InvalidArguments = 0x0004,
    NotStored = 0x0005,
    DeltaBadValue = 0x0006,
    NotMyVbucket = 0x0007,
    NoBucket = 0x0008,
    AuthStale = 0x001f,
    AuthError = 0x0020,
    AuthContinue = 0x0021,
    Range = 0x0022,
    Rollback = 0x0023,
    AccessDenied = 0x0024,
    NotInitialized = 0x0025,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
    NotSupported = 0x0083,
    InternalError = 0x0084,
    Busy = 0x0085,
    TempFailure = 0x0086,
}

impl Status {
    /// Try to convert a u16 to a status.
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0000 => Some(Status::Success),
            0x0001 => Some(Status::KeyNotFound),
            0x0002 => Some(Status::KeyExists),
            0x0003 => Some(Status::TooBig),
            0x0004 => Some(Status::InvalidArguments),
            0x0005 => Some(Status::NotStored),
            0x0006 => Some(Status::DeltaBadValue),
            0x0007 => Some(Status::NotMyVbucket),
            0x0008 => Some(Status::NoBucket),
            0x001f => Some(Status::AuthStale),
            0x0020 => Some(Status::AuthError),
            0x0021 => Some(Status::AuthContinue),
            0x0022 => Some(Status::Range),
            0x0023 => Some(Status::Rollback),
            0x0024 => Some(Status::AccessDenied),
            0x0025 => Some(Status::NotInitialized),
            0x0081 => Some(Status::UnknownCommand),
            0x0082 => Some(Status::OutOfMemory),
            0x0083 => Some(Status::NotSupported),
            0x0084 => Some(Status::InternalError),
            0x0085 => Some(Status::Busy),
            0x0086 => Some(Status::TempFailure),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns true if this status indicates success.
    pub fn is_success(&self) -> bool {
        *self == Status::Success
    }

    /// Classification used by `ConnectionError` predicates.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Status::KeyNotFound => Some(ErrorClass::NotFound),
            Status::KeyExists => Some(ErrorClass::AlreadyExists),
            Status::InvalidArguments => Some(ErrorClass::InvalidArguments),
            Status::NotStored => Some(ErrorClass::NotStored),
            Status::NotMyVbucket => Some(ErrorClass::NotMyVbucket),
            Status::AuthError | Status::AccessDenied => Some(ErrorClass::AccessDenied),
            _ => None,
        }
    }

    /// Returns the status as a short description.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::KeyNotFound => "Key not found",
            Status::KeyExists => "Key exists",
            Status::TooBig => "Value too large",
            Status::InvalidArguments => "Invalid arguments",
            Status::NotStored => "Not stored",
            Status::DeltaBadValue => "Non-numeric value",
            Status::NotMyVbucket => "Not my vbucket",
            Status::NoBucket => "No bucket selected",
            Status::AuthStale => "Authentication stale",
            Status::AuthError => "Authentication error",
            Status::AuthContinue => "Authentication continue",
            Status::Range => "Out of range",
            Status::Rollback => "Rollback required",
            Status::AccessDenied => "No access",
            Status::NotInitialized => "Not initialized",
            Status::UnknownCommand => "Unknown command",
            Status::OutOfMemory => "Out of memory",
            Status::NotSupported => "Not supported",
            Status::InternalError => "Internal error",
            Status::Busy => "Busy",
            Status::TempFailure => "Temporary failure",
        }
    }
}

/// HELLO features the client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Feature {
    Datatype = 0x01,
    Tls = 0x02,
    TcpNodelay = 0x03,
    MutationSeqno = 0x04,
    TcpDelay = 0x05,
}

impl Feature {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x01 => Some(Feature::Datatype),
            0x02 => Some(Feature::Tls),
            0x03 => Some(Feature::TcpNodelay),
            0x04 => Some(Feature::MutationSeqno),
            0x05 => Some(Feature::TcpDelay),
            _ => None,
        }
    }
}

/// Engine module loaded by CREATE_BUCKET for each bucket type.
pub fn bucket_module(bucket_type: BucketType) -> &'static str {
    match bucket_type {
        BucketType::Memcached => "default_engine.so",
        BucketType::Couchbase => "ep.so",
        BucketType::EWouldBlock => "ewouldblock_engine.so",
    }
}

/// Request header (24 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub magic: u8,
    /// Raw opcode byte; see `Opcode::from_u8`.
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub datatype: u8,
    pub vbucket: u16,
    /// extras + key + value
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl RequestHeader {
    /// Parse a request header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::Incomplete);
        }
        if data[0] != REQUEST_MAGIC {
            return Err(CodecError::InvalidMagic(data[0]));
        }
        let header = RequestHeader {
            magic: data[0],
            opcode: data[1],
            key_length: u16::from_be_bytes([data[2], data[3]]),
            extras_length: data[4],
            datatype: data[5],
            vbucket: u16::from_be_bytes([data[6], data[7]]),
            total_body_length: read_u32(&data[8..12]),
            opaque: read_u32(&data[12..16]),
            cas: read_u64(&data[16..24]),
        };
        if (header.key_length as usize + header.extras_length as usize)
            > header.total_body_length as usize
        {
            return Err(CodecError::Malformed("key and extras exceed body length"));
        }
        Ok(header)
    }

    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.magic);
        out.push(self.opcode);
        out.extend_from_slice(&self.key_length.to_be_bytes());
        out.push(self.extras_length);
        out.push(self.datatype);
        out.extend_from_slice(&self.vbucket.to_be_bytes());
        out.extend_from_slice(&self.total_body_length.to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
    }
}

/// Response header (24 bytes). Same layout as the request, with a status in
/// place of the vbucket id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub datatype: u8,
    pub status: u16,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    /// Parse a response header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::Incomplete);
        }
        if data[0] != RESPONSE_MAGIC {
            return Err(CodecError::InvalidMagic(data[0]));
        }
        let header = ResponseHeader {
            magic: data[0],
            opcode: data[1],
            key_length: u16::from_be_bytes([data[2], data[3]]),
            extras_length: data[4],
            datatype: data[5],
            status: u16::from_be_bytes([data[6], data[7]]),
            total_body_length: read_u32(&data[8..12]),
            opaque: read_u32(&data[12..16]),
            cas: read_u64(&data[16..24]),
        };
        if (header.key_length as usize + header.extras_length as usize)
            > header.total_body_length as usize
        {
            return Err(CodecError::Malformed("key and extras exceed body length"));
        }
        Ok(header)
    }

    /// Append the encoded header to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.magic);
        out.push(self.opcode);
        out.extend_from_slice(&self.key_length.to_be_bytes());
        out.push(self.extras_length);
        out.push(self.datatype);
        out.extend_from_slice(&self.status.to_be_bytes());
        out.extend_from_slice(&self.total_body_length.to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
    }
}

/// Total frame length announced by a header (header + body).
///
/// Works for both requests and responses since the length field is shared.
pub fn frame_length(header: &[u8]) -> Result<usize, CodecError> {
    if header.len() < HEADER_SIZE {
        return Err(CodecError::Incomplete);
    }
    if header[0] != REQUEST_MAGIC && header[0] != RESPONSE_MAGIC {
        return Err(CodecError::InvalidMagic(header[0]));
    }
    let body = read_u32(&header[8..12]) as usize;
    if body > MAX_FRAME_SIZE - HEADER_SIZE {
        return Err(CodecError::Malformed("frame exceeds maximum size"));
    }
    Ok(HEADER_SIZE + body)
}

/// Builder for one request packet.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub opcode: Opcode,
    pub datatype: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub extras: &'a [u8],
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> Request<'a> {
    /// Creates an empty request for `opcode`.
    pub fn new(opcode: Opcode) -> Self {
        Request {
            opcode,
            datatype: 0,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: &[],
            key: &[],
            value: &[],
        }
    }

    pub fn key(mut self, key: &'a [u8]) -> Self {
        self.key = key;
        self
    }

    pub fn extras(mut self, extras: &'a [u8]) -> Self {
        self.extras = extras;
        self
    }

    pub fn value(mut self, value: &'a [u8]) -> Self {
        self.value = value;
        self
    }

    pub fn vbucket(mut self, vbucket: u16) -> Self {
        self.vbucket = vbucket;
        self
    }

    pub fn opaque(mut self, opaque: u32) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn datatype(mut self, datatype: u8) -> Self {
        self.datatype = datatype;
        self
    }

    /// Encodes the packet, replacing the contents of `frame`.
    pub fn encode(&self, frame: &mut Frame) -> Result<(), CodecError> {
        if self.key.len() > u16::MAX as usize {
            return Err(CodecError::KeyTooLong(self.key.len()));
        }
        if self.extras.len() > u8::MAX as usize {
            return Err(CodecError::Malformed("extras longer than 255 bytes"));
        }
        let body = self.extras.len() + self.key.len() + self.value.len();
        let body = u32::try_from(body).map_err(|_| CodecError::Malformed("body too large"))?;

        let header = RequestHeader {
            magic: REQUEST_MAGIC,
            opcode: self.opcode.as_u8(),
            key_length: self.key.len() as u16,
            extras_length: self.extras.len() as u8,
            datatype: self.datatype,
            vbucket: self.vbucket,
            total_body_length: body,
            opaque: self.opaque,
            cas: self.cas,
        };

        let mut buf = Vec::with_capacity(HEADER_SIZE + body as usize);
        header.encode(&mut buf);
        buf.extend_from_slice(self.extras);
        buf.extend_from_slice(self.key);
        buf.extend_from_slice(self.value);

        frame.reset();
        frame.extend_from_slice(&buf);
        Ok(())
    }
}

/// A decoded response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub header: ResponseHeader,
    body: Bytes,
}

impl Response {
    /// Decodes one complete response packet.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        let header = ResponseHeader::parse(data)?;
        let total = HEADER_SIZE + header.total_body_length as usize;
        if data.len() < total {
            return Err(CodecError::Incomplete);
        }
        if data.len() > total {
            return Err(CodecError::Malformed("trailing bytes after response"));
        }
        Ok(Response {
            header,
            body: Bytes::copy_from_slice(&data[HEADER_SIZE..total]),
        })
    }

    /// Raw status code.
    pub fn status(&self) -> u16 {
        self.header.status
    }

    pub fn is_success(&self) -> bool {
        self.header.status == Status::Success.as_u16()
    }

    pub fn opcode(&self) -> u8 {
        self.header.opcode
    }

    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    pub fn datatype(&self) -> u8 {
        self.header.datatype
    }

    pub fn extras(&self) -> &[u8] {
        &self.body[..self.header.extras_length as usize]
    }

    pub fn key(&self) -> &[u8] {
        let start = self.header.extras_length as usize;
        &self.body[start..start + self.header.key_length as usize]
    }

    pub fn value(&self) -> &[u8] {
        let start = self.header.extras_length as usize + self.header.key_length as usize;
        &self.body[start..]
    }
}

/// Reads a big-endian u32; `data` must hold at least 4 bytes.
pub fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// Reads a big-endian u64; `data` must hold at least 8 bytes.
pub fn read_u64(data: &[u8]) -> u64 {
    u64::from_be_bytes([
        data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_get_request_bit_exact() {
        let mut frame = Frame::new();
        Request::new(Opcode::Get)
            .key(b"foo")
            .vbucket(5)
            .opaque(0xdeadbeef)
            .encode(&mut frame)
            .unwrap();

        let expected: Vec<u8> = vec![
            0x80, 0x00, 0x00, 0x03, // magic, opcode, keylen
            0x00, 0x00, 0x00, 0x05, // extlen, datatype, vbucket
            0x00, 0x00, 0x00, 0x03, // bodylen
            0xde, 0xad, 0xbe, 0xef, // opaque
            0, 0, 0, 0, 0, 0, 0, 0, // cas
            b'f', b'o', b'o',
        ];
        assert_eq!(frame.as_slice(), &expected[..]);
    }

    #[test]
    fn encodes_set_with_extras_and_cas() {
        let extras = [0u8, 0, 0, 1, 0, 0, 0, 0];
        let mut frame = Frame::new();
        Request::new(Opcode::Set)
            .key(b"k")
            .extras(&extras)
            .value(b"vv")
            .cas(0x0102030405060708)
            .datatype(DATATYPE_JSON)
            .encode(&mut frame)
            .unwrap();

        let data = frame.as_slice();
        let header = RequestHeader::parse(data).unwrap();
        assert_eq!(header.opcode, 0x01);
        assert_eq!(header.extras_length, 8);
        assert_eq!(header.key_length, 1);
        assert_eq!(header.total_body_length, 11);
        assert_eq!(header.datatype, DATATYPE_JSON);
        assert_eq!(header.cas, 0x0102030405060708);
        assert_eq!(&data[24..32], &extras);
        assert_eq!(&data[32..], b"kvv");
    }

    #[test]
    fn encode_replaces_previous_contents() {
        let mut frame = Frame::from_slice(b"stale");
        Request::new(Opcode::Noop).encode(&mut frame).unwrap();
        assert_eq!(frame.len(), HEADER_SIZE);
    }

    #[test]
    fn parses_response_sections() {
        let mut buf = Vec::new();
        ResponseHeader {
            magic: RESPONSE_MAGIC,
            opcode: Opcode::Get.as_u8(),
            key_length: 2,
            extras_length: 4,
            datatype: 0,
            status: 0,
            total_body_length: 4 + 2 + 3,
            opaque: 7,
            cas: 99,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&[0, 0, 0, 9]);
        buf.extend_from_slice(b"idval");

        let response = Response::parse(&buf).unwrap();
        assert!(response.is_success());
        assert_eq!(response.extras(), &[0, 0, 0, 9]);
        assert_eq!(response.key(), b"id");
        assert_eq!(response.value(), b"val");
        assert_eq!(response.cas(), 99);
        assert_eq!(response.opaque(), 7);
    }

    #[test]
    fn frame_length_reads_body_length() {
        let mut frame = Frame::new();
        Request::new(Opcode::Set)
            .key(b"abc")
            .value(b"12345")
            .encode(&mut frame)
            .unwrap();
        assert_eq!(frame_length(frame.as_slice()).unwrap(), HEADER_SIZE + 8);
    }

    #[test]
    fn frame_length_rejects_oversized_body() {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = RESPONSE_MAGIC;
        header[8..12].copy_from_slice(&0xffff_fff0u32.to_be_bytes());
        assert!(matches!(frame_length(&header), Err(CodecError::Malformed(_))));

        let limit = (MAX_FRAME_SIZE - HEADER_SIZE) as u32;
        header[8..12].copy_from_slice(&limit.to_be_bytes());
        assert_eq!(frame_length(&header).unwrap(), MAX_FRAME_SIZE);
        header[8..12].copy_from_slice(&(limit + 1).to_be_bytes());
        assert!(frame_length(&header).is_err());
    }

    #[test]
    fn rejects_bad_magic_and_short_input() {
        assert!(matches!(
            ResponseHeader::parse(&[0x42; HEADER_SIZE]),
            Err(CodecError::InvalidMagic(0x42))
        ));
        assert!(ResponseHeader::parse(&[0x81; 10]).unwrap_err().is_incomplete());
        assert!(matches!(frame_length(&[0x00; HEADER_SIZE]), Err(CodecError::InvalidMagic(0))));
    }

    #[test]
    fn rejects_inconsistent_lengths() {
        let mut buf = Vec::new();
        ResponseHeader {
            magic: RESPONSE_MAGIC,
            opcode: 0,
            key_length: 10,
            extras_length: 0,
            datatype: 0,
            status: 0,
            total_body_length: 2,
            opaque: 0,
            cas: 0,
        }
        .encode(&mut buf);
        assert!(matches!(ResponseHeader::parse(&buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn status_table_round_trips() {
        for code in 0u16..=0x00ff {
            if let Some(status) = Status::from_u16(code) {
                assert_eq!(status.as_u16(), code);
            }
        }
        assert_eq!(Status::from_u16(0x0007), Some(Status::NotMyVbucket));
        assert!(Status::from_u16(0x7777).is_none());
    }

    #[test]
    fn bucket_modules() {
        assert_eq!(bucket_module(BucketType::Memcached), "default_engine.so");
        assert_eq!(bucket_module(BucketType::Couchbase), "ep.so");
        assert_eq!(bucket_module(BucketType::EWouldBlock), "ewouldblock_engine.so");
    }
}
