//! # Binary Protocol Connection
//!
//! Purpose: Implement the connection contract over the 24 byte header
//! protocol, including pipelined (asynchronous) raw frames.
//!
//! ## Design Principles
//! 1. **Round Trip Helper**: Every high-level call is encode, send, receive,
//!    check; rejections become `ConnectionError` with the server status.
//! 2. **FIFO Opaques**: In asynchronous mode each sent request's opaque is
//!    queued and every response must answer the oldest one.
//! 3. **Byte Stream Tracking**: Outgoing bytes are walked request by request,
//!    so opaques are recorded however the frames are split across sends.

use std::collections::VecDeque;
use std::fmt;

use mcd_common::mcbp::{
    self, Feature, Opcode, Request, RequestHeader, Response, ResponseHeader, Status,
    DATATYPE_JSON, DATATYPE_SNAPPY, DCP_OPEN_PRODUCER, HEADER_SIZE,
};
use mcd_common::{
    sasl, AddressFamily, BucketType, Compression, ConnectionError, Datatype, Document,
    DocumentInfo, EwbEngineMode, Frame, MutationInfo, MutationType, Protocol,
};
use tracing::{debug, trace, warn};

use crate::config::ConnectionOptions;
use crate::connection::{parse_expiration, ConnectionCore, ConnectionState, MemcachedConnection};
use crate::error::{ClientError, ClientResult};

/// Features requested in HELLO.
const REQUESTED_FEATURES: [Feature; 2] = [Feature::TcpNodelay, Feature::MutationSeqno];

/// Position inside the outgoing request stream.
#[derive(Debug, Clone, Default)]
struct Outgoing {
    /// Header bytes of the request being sent, until all 24 have gone out.
    header: Vec<u8>,
    /// Body bytes still owed by the request whose header was sent.
    body_remaining: usize,
}

impl Outgoing {
    fn is_idle(&self) -> bool {
        self.header.is_empty() && self.body_remaining == 0
    }

    /// Walks `data` and appends the opaque of every request whose header
    /// completes within it.
    fn advance(&mut self, mut data: &[u8], opaques: &mut Vec<u32>) -> ClientResult<()> {
        while !data.is_empty() {
            if self.body_remaining > 0 {
                let n = self.body_remaining.min(data.len());
                self.body_remaining -= n;
                data = &data[n..];
                continue;
            }
            let n = (HEADER_SIZE - self.header.len()).min(data.len());
            self.header.extend_from_slice(&data[..n]);
            data = &data[n..];
            if self.header.len() == HEADER_SIZE {
                let header = RequestHeader::parse(&self.header)?;
                opaques.push(header.opaque);
                self.body_remaining = header.total_body_length as usize;
                self.header.clear();
            }
        }
        Ok(())
    }
}

/// Connection speaking the legacy binary protocol.
pub struct BinprotConnection {
    core: ConnectionCore,
    /// Opaques of requests sent in asynchronous mode, oldest first.
    pending: VecDeque<u32>,
    outgoing: Outgoing,
    mutation_seqno: bool,
}

impl BinprotConnection {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        family: AddressFamily,
        ssl: bool,
        options: ConnectionOptions,
    ) -> Self {
        Self::from_core(ConnectionCore::new(
            host,
            port,
            family,
            ssl,
            Protocol::Memcached,
            options,
        ))
    }

    pub(crate) fn from_core(core: ConnectionCore) -> Self {
        BinprotConnection {
            core,
            pending: VecDeque::new(),
            outgoing: Outgoing::default(),
            mutation_seqno: false,
        }
    }

    /// Writes `data`, queueing the opaques it carries when asynchronous.
    fn write(&mut self, data: &[u8]) -> ClientResult<()> {
        if !self.core.is_asynchronous() {
            return self.core.send(data);
        }
        let mut outgoing = self.outgoing.clone();
        let mut opaques = Vec::new();
        outgoing.advance(data, &mut opaques)?;
        self.core.send(data)?;
        self.outgoing = outgoing;
        self.pending.extend(opaques);
        Ok(())
    }

    fn encode(&mut self, request: Request<'_>) -> ClientResult<Frame> {
        let mut frame = Frame::with_capacity(HEADER_SIZE + request.key.len() + request.value.len());
        request
            .opaque(self.core.next_opaque())
            .encode(&mut frame)?;
        Ok(frame)
    }

    /// Sends `frame` and reads its response without checking the status.
    fn execute(&mut self, frame: &Frame) -> ClientResult<Response> {
        let opaque = RequestHeader::parse(frame.as_slice())?.opaque;
        self.send_frame(frame)?;
        let mut reply = Frame::new();
        self.recv_frame(&mut reply)?;
        let response = Response::parse(reply.as_slice())?;
        if response.opaque() != opaque {
            return Err(ClientError::UnexpectedResponse(format!(
                "opaque {:#x} does not match request {:#x}",
                response.opaque(),
                opaque
            )));
        }
        Ok(response)
    }

    fn round_trip(&mut self, request: Request<'_>, context: &str) -> ClientResult<Response> {
        let frame = self.encode(request)?;
        let response = self.execute(&frame)?;
        if !response.is_success() {
            return Err(rejected(response.status(), context));
        }
        Ok(response)
    }
}

fn rejected(status: u16, context: &str) -> ClientError {
    let err = ConnectionError::new(Protocol::Memcached, status, context);
    warn!(error = %err, "request rejected");
    err.into()
}

fn datatype_bits(info: &DocumentInfo) -> u8 {
    let mut bits = 0;
    if info.datatype == Datatype::Json {
        bits |= DATATYPE_JSON;
    }
    if info.compression == Compression::Snappy {
        bits |= DATATYPE_SNAPPY;
    }
    bits
}

fn mutation_opcode(mutation_type: MutationType) -> Opcode {
    match mutation_type {
        MutationType::Add => Opcode::Add,
        MutationType::Set => Opcode::Set,
        MutationType::Replace => Opcode::Replace,
        MutationType::Append => Opcode::Append,
        MutationType::Prepend => Opcode::Prepend,
        MutationType::Delete => Opcode::Delete,
    }
}

impl MemcachedConnection for BinprotConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn set_synchronous(&mut self, enable: bool) -> ClientResult<()> {
        if enable && !self.pending.is_empty() {
            return Err(ClientError::InvalidArgument(format!(
                "{} asynchronous responses outstanding",
                self.pending.len()
            )));
        }
        if enable && !self.outgoing.is_idle() {
            return Err(ClientError::InvalidArgument(
                "a partially sent request is outstanding".to_string(),
            ));
        }
        self.core.set_synchronous(enable);
        Ok(())
    }

    fn connect(&mut self) -> ClientResult<()> {
        self.pending.clear();
        self.outgoing = Outgoing::default();
        self.mutation_seqno = false;
        self.core.connect()
    }

    fn close(&mut self) {
        self.pending.clear();
        self.outgoing = Outgoing::default();
        self.mutation_seqno = false;
        self.core.close();
    }

    fn clone_connection(&self) -> Box<dyn MemcachedConnection> {
        Box::new(BinprotConnection::from_core(self.core.clone_target()))
    }

    fn hello(
        &mut self,
        user_agent: &str,
        user_agent_version: &str,
        comment: &str,
    ) -> ClientResult<()> {
        self.core.require_synchronous()?;

        let mut agent = format!("{user_agent} {user_agent_version}");
        if !comment.is_empty() {
            agent.push_str(&format!(" ({comment})"));
        }
        let mut features = Vec::with_capacity(REQUESTED_FEATURES.len() * 2);
        for feature in REQUESTED_FEATURES {
            features.extend_from_slice(&(feature as u16).to_be_bytes());
        }

        let frame = self.encode(
            Request::new(Opcode::Hello)
                .key(agent.as_bytes())
                .value(&features),
        )?;
        let response = self.execute(&frame)?;
        if !response.is_success() {
            warn!(status = response.status(), "server rejected HELLO");
            return Err(ClientError::NotSupported("HELLO negotiation"));
        }
        self.mutation_seqno = response
            .value()
            .chunks_exact(2)
            .any(|c| u16::from_be_bytes([c[0], c[1]]) == Feature::MutationSeqno as u16);

        let response = self.round_trip(Request::new(Opcode::SaslListMechs), "sasl list mechs")?;
        let mechanisms = sasl::parse_mechanisms(&String::from_utf8_lossy(response.value()));
        debug!(mechanisms = ?mechanisms, "hello complete");
        self.core.set_sasl_mechanisms(mechanisms);
        Ok(())
    }

    fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        mechanism: &str,
    ) -> ClientResult<()> {
        self.core.require_synchronous()?;
        let mut mech = sasl::mechanism(mechanism).ok_or_else(|| {
            ClientError::InvalidArgument(format!("unsupported SASL mechanism: {mechanism}"))
        })?;
        let name = mech.name();
        let initial = mech.start(username, password);
        let mut frame = self.encode(
            Request::new(Opcode::SaslAuth)
                .key(name.as_bytes())
                .value(&initial),
        )?;

        loop {
            let response = self.execute(&frame)?;
            match Status::from_u16(response.status()) {
                Some(Status::Success) => break,
                Some(Status::AuthContinue) => {
                    let next = mech.step(response.value()).ok_or_else(|| {
                        ClientError::UnexpectedResponse(format!(
                            "{name} exchange already complete"
                        ))
                    })?;
                    frame = self.encode(
                        Request::new(Opcode::SaslStep)
                            .key(name.as_bytes())
                            .value(&next),
                    )?;
                }
                _ => return Err(rejected(response.status(), "authenticate")),
            }
        }

        debug!(user = username, mechanism = name, "authenticated");
        self.core.set_state(ConnectionState::Authenticated);
        Ok(())
    }

    fn create_bucket(
        &mut self,
        name: &str,
        config: &str,
        bucket_type: BucketType,
    ) -> ClientResult<()> {
        self.core.require_authenticated("create bucket")?;
        let module = mcbp::bucket_module(bucket_type);
        let mut value = Vec::with_capacity(module.len() + 1 + config.len());
        value.extend_from_slice(module.as_bytes());
        value.push(0);
        value.extend_from_slice(config.as_bytes());
        self.round_trip(
            Request::new(Opcode::CreateBucket)
                .key(name.as_bytes())
                .value(&value),
            "create bucket",
        )?;
        Ok(())
    }

    fn delete_bucket(&mut self, name: &str) -> ClientResult<()> {
        self.core.require_authenticated("delete bucket")?;
        self.round_trip(
            Request::new(Opcode::DeleteBucket).key(name.as_bytes()),
            "delete bucket",
        )?;
        Ok(())
    }

    fn select_bucket(&mut self, name: &str) -> ClientResult<()> {
        self.core.require_authenticated("select bucket")?;
        self.round_trip(
            Request::new(Opcode::SelectBucket).key(name.as_bytes()),
            "select bucket",
        )?;
        self.core.set_state(ConnectionState::BucketSelected);
        Ok(())
    }

    fn list_buckets(&mut self) -> ClientResult<Vec<String>> {
        self.core.require_authenticated("list buckets")?;
        let response = self.round_trip(Request::new(Opcode::ListBuckets), "list buckets")?;
        Ok(String::from_utf8_lossy(response.value())
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }

    fn get(&mut self, id: &str, vbucket: u16) -> ClientResult<Document> {
        self.core.require_authenticated("get")?;
        let frame = self.encode_cmd_get(id, vbucket)?;
        let response = self.execute(&frame)?;
        if !response.is_success() {
            return Err(rejected(response.status(), "get"));
        }

        let extras = response.extras();
        let flags = if extras.len() >= 4 {
            mcbp::read_u32(extras)
        } else {
            0
        };
        let datatype = response.datatype();
        Ok(Document {
            info: DocumentInfo {
                id: id.to_string(),
                flags,
                expiration: String::new(),
                compression: if datatype & DATATYPE_SNAPPY != 0 {
                    Compression::Snappy
                } else {
                    Compression::None
                },
                datatype: if datatype & DATATYPE_JSON != 0 {
                    Datatype::Json
                } else {
                    Datatype::Raw
                },
                cas: response.cas(),
            },
            value: response.value().to_vec(),
        })
    }

    fn mutate(
        &mut self,
        doc: &Document,
        vbucket: u16,
        mutation_type: MutationType,
    ) -> ClientResult<MutationInfo> {
        self.core.require_authenticated("mutate")?;
        let opcode = mutation_opcode(mutation_type);

        let mut extras = Vec::with_capacity(8);
        if matches!(
            mutation_type,
            MutationType::Add | MutationType::Set | MutationType::Replace
        ) {
            let expiration = parse_expiration(&doc.info.expiration)?;
            extras.extend_from_slice(&doc.info.flags.to_be_bytes());
            extras.extend_from_slice(&expiration.to_be_bytes());
        }
        let value: &[u8] = if mutation_type == MutationType::Delete {
            &[]
        } else {
            &doc.value
        };

        let response = self.round_trip(
            Request::new(opcode)
                .key(doc.info.id.as_bytes())
                .extras(&extras)
                .value(value)
                .vbucket(vbucket)
                .cas(doc.info.cas)
                .datatype(datatype_bits(&doc.info)),
            "mutate",
        )?;

        let mut info = MutationInfo {
            cas: response.cas(),
            size: value.len(),
            seqno: 0,
            vbucket_uuid: 0,
        };
        let extras = response.extras();
        if self.mutation_seqno && extras.len() == 16 {
            info.vbucket_uuid = mcbp::read_u64(&extras[..8]);
            info.seqno = mcbp::read_u64(&extras[8..]);
        }
        Ok(info)
    }

    fn stats(&mut self, subcommand: &str) -> ClientResult<serde_json::Value> {
        self.core.require_synchronous()?;
        let frame = self.encode(Request::new(Opcode::Stat).key(subcommand.as_bytes()))?;
        let opaque = RequestHeader::parse(frame.as_slice())?.opaque;
        self.send_frame(&frame)?;

        let mut map = serde_json::Map::new();
        let mut reply = Frame::new();
        loop {
            self.recv_frame(&mut reply)?;
            let response = Response::parse(reply.as_slice())?;
            if response.opaque() != opaque {
                return Err(ClientError::UnexpectedResponse(format!(
                    "stat reply for opaque {:#x}",
                    response.opaque()
                )));
            }
            if !response.is_success() {
                return Err(rejected(response.status(), "stats"));
            }
            if response.key().is_empty() {
                break;
            }
            map.insert(
                String::from_utf8_lossy(response.key()).into_owned(),
                serde_json::Value::String(String::from_utf8_lossy(response.value()).into_owned()),
            );
        }
        Ok(serde_json::Value::Object(map))
    }

    fn reload_audit_configuration(&mut self) -> ClientResult<()> {
        self.core.require_authenticated("audit config reload")?;
        self.round_trip(
            Request::new(Opcode::AuditConfigReload),
            "audit config reload",
        )?;
        Ok(())
    }

    fn encode_cmd_get(&mut self, id: &str, vbucket: u16) -> ClientResult<Frame> {
        self.encode(Request::new(Opcode::Get).key(id.as_bytes()).vbucket(vbucket))
    }

    fn encode_cmd_dcp_open(&mut self) -> ClientResult<Frame> {
        let mut extras = [0u8; 8];
        extras[4..].copy_from_slice(&DCP_OPEN_PRODUCER.to_be_bytes());
        self.encode(Request::new(Opcode::DcpOpen).key(b"dcp").extras(&extras))
    }

    fn encode_cmd_dcp_stream_req(&mut self) -> ClientResult<Frame> {
        // flags, reserved, start, end, vbucket uuid, snapshot start, snapshot end
        let mut extras = Vec::with_capacity(48);
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        extras.extend_from_slice(&0u64.to_be_bytes());
        extras.extend_from_slice(&u64::MAX.to_be_bytes());
        extras.extend_from_slice(&0u64.to_be_bytes());
        extras.extend_from_slice(&0u64.to_be_bytes());
        extras.extend_from_slice(&0u64.to_be_bytes());
        self.encode(Request::new(Opcode::DcpStreamReq).extras(&extras))
    }

    fn configure_ewouldblock_engine(
        &mut self,
        mode: EwbEngineMode,
        err_code: u32,
        value: u32,
        key: &str,
    ) -> ClientResult<()> {
        self.core.require_authenticated("ewouldblock control")?;
        let mut extras = Vec::with_capacity(12);
        extras.extend_from_slice(&(mode as u32).to_be_bytes());
        extras.extend_from_slice(&value.to_be_bytes());
        extras.extend_from_slice(&err_code.to_be_bytes());
        self.round_trip(
            Request::new(Opcode::EwouldblockCtl)
                .key(key.as_bytes())
                .extras(&extras),
            "ewouldblock control",
        )?;
        Ok(())
    }

    fn ioctl_get(&mut self, key: &str) -> ClientResult<String> {
        self.core.require_authenticated("ioctl get")?;
        let response =
            self.round_trip(Request::new(Opcode::IoctlGet).key(key.as_bytes()), "ioctl get")?;
        Ok(String::from_utf8_lossy(response.value()).into_owned())
    }

    fn ioctl_set(&mut self, key: &str, value: &str) -> ClientResult<()> {
        self.core.require_authenticated("ioctl set")?;
        self.round_trip(
            Request::new(Opcode::IoctlSet)
                .key(key.as_bytes())
                .value(value.as_bytes()),
            "ioctl set",
        )?;
        Ok(())
    }

    fn send_frame(&mut self, frame: &Frame) -> ClientResult<()> {
        self.write(frame.as_slice())
    }

    fn send_partial_frame(&mut self, frame: &mut Frame, length: usize) -> ClientResult<()> {
        if length > frame.len() {
            return Err(ClientError::InvalidArgument(format!(
                "cannot send {length} bytes of a {} byte frame",
                frame.len()
            )));
        }
        self.write(&frame.as_slice()[..length])?;
        frame.consume(length);
        Ok(())
    }

    fn recv_frame(&mut self, frame: &mut Frame) -> ClientResult<()> {
        frame.reset();
        self.core.read_into(frame, HEADER_SIZE)?;
        let total = mcbp::frame_length(frame.as_slice())?;
        self.core.read_into(frame, total - HEADER_SIZE)?;

        let header = ResponseHeader::parse(frame.as_slice())?;
        trace!(
            opcode = header.opcode,
            status = header.status,
            len = total,
            "received response"
        );

        if self.core.is_asynchronous() {
            match self.pending.pop_front() {
                Some(expected) if expected == header.opaque => {}
                Some(expected) => {
                    return Err(ClientError::UnexpectedResponse(format!(
                        "response opaque {:#x} does not answer oldest request {:#x}",
                        header.opaque, expected
                    )));
                }
                None => {
                    return Err(ClientError::UnexpectedResponse(
                        "response without an outstanding request".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for BinprotConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> BinprotConnection {
        BinprotConnection::new(
            "127.0.0.1",
            11210,
            AddressFamily::Inet,
            false,
            ConnectionOptions::default(),
        )
    }

    #[test]
    fn encoded_get_carries_key_and_vbucket() {
        let mut conn = connection();
        let frame = conn.encode_cmd_get("hello", 42).unwrap();
        let header = RequestHeader::parse(frame.as_slice()).unwrap();
        assert_eq!(header.opcode, Opcode::Get.as_u8());
        assert_eq!(header.vbucket, 42);
        assert_eq!(&frame.as_slice()[HEADER_SIZE..], b"hello");
    }

    #[test]
    fn opaques_increase_per_request() {
        let mut conn = connection();
        let a = conn.encode_cmd_get("a", 0).unwrap();
        let b = conn.encode_cmd_get("a", 0).unwrap();
        let a = RequestHeader::parse(a.as_slice()).unwrap().opaque;
        let b = RequestHeader::parse(b.as_slice()).unwrap().opaque;
        assert_eq!(b, a + 1);
    }

    #[test]
    fn dcp_open_requests_producer() {
        let mut conn = connection();
        let frame = conn.encode_cmd_dcp_open().unwrap();
        let data = frame.as_slice();
        let header = RequestHeader::parse(data).unwrap();
        assert_eq!(header.opcode, Opcode::DcpOpen.as_u8());
        assert_eq!(header.extras_length, 8);
        assert_eq!(&data[HEADER_SIZE..HEADER_SIZE + 8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&data[HEADER_SIZE + 8..], b"dcp");
    }

    #[test]
    fn dcp_stream_req_has_open_ended_range() {
        let mut conn = connection();
        let frame = conn.encode_cmd_dcp_stream_req().unwrap();
        let data = frame.as_slice();
        let header = RequestHeader::parse(data).unwrap();
        assert_eq!(header.extras_length, 48);
        assert_eq!(header.key_length, 0);
        let extras = &data[HEADER_SIZE..];
        assert_eq!(mcbp::read_u64(&extras[8..16]), 0);
        assert_eq!(mcbp::read_u64(&extras[16..24]), u64::MAX);
    }

    #[test]
    fn datatype_bits_follow_document_info() {
        let mut info = DocumentInfo::default();
        assert_eq!(datatype_bits(&info), 0);
        info.datatype = Datatype::Json;
        info.compression = Compression::Snappy;
        assert_eq!(datatype_bits(&info), DATATYPE_JSON | DATATYPE_SNAPPY);
    }

    #[test]
    fn outgoing_tracks_requests_across_chunks() {
        let mut conn = connection();
        let mut stream = conn.encode_cmd_get("first", 0).unwrap();
        let second = conn.encode_cmd_get("second", 0).unwrap();
        stream.extend_from_slice(second.as_slice());
        let data = stream.as_slice();

        let mut outgoing = Outgoing::default();
        let mut opaques = Vec::new();
        outgoing.advance(&data[..10], &mut opaques).unwrap();
        assert!(opaques.is_empty());
        assert!(!outgoing.is_idle());
        outgoing.advance(&data[10..40], &mut opaques).unwrap();
        assert_eq!(opaques, vec![1]);
        outgoing.advance(&data[40..], &mut opaques).unwrap();
        assert_eq!(opaques, vec![1, 2]);
        assert!(outgoing.is_idle());
    }

    #[test]
    fn outgoing_rejects_non_request_bytes() {
        let mut outgoing = Outgoing::default();
        let mut opaques = Vec::new();
        let err = outgoing.advance(&[0x81; HEADER_SIZE], &mut opaques).unwrap_err();
        assert!(matches!(err, ClientError::Codec(_)));
    }

    #[test]
    fn async_mode_is_allowed() {
        let mut conn = connection();
        conn.set_synchronous(false).unwrap();
        assert!(!conn.is_synchronous());
        conn.set_synchronous(true).unwrap();
    }
}
