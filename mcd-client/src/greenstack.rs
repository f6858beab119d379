//! # Greenstack Connection
//!
//! Purpose: Implement the connection contract over the length-prefixed
//! Greenstack protocol. Control payloads are JSON; documents carry a JSON
//! metadata block followed by the raw value.
//!
//! Greenstack gives no response ordering guarantee on a shared connection, so
//! asynchronous mode is refused.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mcd_common::greenstack::payload::{
    BucketName, CreateBucketRequest, DcpOpenRequest, DcpStreamRequest, GetRequest, HelloRequest,
    HelloResponse, ListBucketsResponse, MutationMeta, SaslAuthRequest, StatsRequest,
};
use mcd_common::greenstack::{self, Message, Opcode, LENGTH_PREFIX};
use mcd_common::mcbp::DCP_OPEN_PRODUCER;
use mcd_common::{
    sasl, AddressFamily, BucketType, ConnectionError, Document, DocumentInfo, EwbEngineMode, Frame,
    MutationInfo, MutationType, Protocol,
};
use tracing::{debug, trace, warn};

use crate::config::ConnectionOptions;
use crate::connection::{parse_expiration, ConnectionCore, ConnectionState, MemcachedConnection};
use crate::error::{ClientError, ClientResult};

/// Connection speaking Greenstack.
pub struct GreenstackConnection {
    core: ConnectionCore,
}

impl GreenstackConnection {
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
            Protocol::Greenstack,
            options,
        ))
    }

    pub(crate) fn from_core(core: ConnectionCore) -> Self {
        GreenstackConnection { core }
    }

    fn encode(&mut self, message: Message) -> ClientResult<Frame> {
        Ok(self.encode_with_opaque(message)?.0)
    }

    fn encode_with_opaque(&mut self, message: Message) -> ClientResult<(Frame, u32)> {
        let opaque = self.core.next_opaque();
        let mut frame = Frame::with_capacity(64 + message.payload.len());
        message.with_opaque(opaque).encode(&mut frame)?;
        Ok((frame, opaque))
    }

    /// Sends `message` and returns the matching response, whatever its status.
    fn exchange(&mut self, message: Message) -> ClientResult<Message> {
        let (frame, opaque) = self.encode_with_opaque(message)?;
        self.send_frame(&frame)?;

        let mut reply = Frame::new();
        self.recv_frame(&mut reply)?;
        let response = Message::decode(reply.as_slice())?;
        if !response.is_response() || response.opaque != opaque {
            return Err(ClientError::UnexpectedResponse(format!(
                "expected response to opaque {:#x}, got opcode {:#06x} opaque {:#x}",
                opaque, response.opcode, response.opaque
            )));
        }
        Ok(response)
    }

    fn round_trip(&mut self, message: Message, context: &str) -> ClientResult<Message> {
        let response = self.exchange(message)?;
        if !response.is_success() {
            return Err(rejected(response.status, context));
        }
        Ok(response)
    }
}

fn rejected(status: u16, context: &str) -> ClientError {
    let err = ConnectionError::new(Protocol::Greenstack, status, context);
    warn!(error = %err, "request rejected");
    err.into()
}

impl MemcachedConnection for GreenstackConnection {
    fn core(&self) -> &ConnectionCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ConnectionCore {
        &mut self.core
    }

    fn set_synchronous(&mut self, enable: bool) -> ClientResult<()> {
        if !enable {
            return Err(ClientError::NotSupported("asynchronous mode over Greenstack"));
        }
        Ok(())
    }

    fn clone_connection(&self) -> Box<dyn MemcachedConnection> {
        Box::new(GreenstackConnection::from_core(self.core.clone_target()))
    }

    fn hello(
        &mut self,
        user_agent: &str,
        user_agent_version: &str,
        comment: &str,
    ) -> ClientResult<()> {
        self.core.require_synchronous()?;
        let request = Message::request(Opcode::Hello).with_json(&HelloRequest {
            user_agent: user_agent.to_string(),
            user_agent_version: user_agent_version.to_string(),
            comment: comment.to_string(),
        })?;
        let response = self.exchange(request)?;
        if !response.is_success() {
            warn!(status = response.status, "server rejected hello");
            return Err(ClientError::NotSupported("hello negotiation"));
        }
        let hello: HelloResponse = response.json()?;
        let mechanisms = sasl::parse_mechanisms(&hello.sasl_mechanisms);
        debug!(
            server = %hello.server,
            version = %hello.version,
            mechanisms = ?mechanisms,
            "hello complete"
        );
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
        let request = Message::request(Opcode::SaslAuth).with_json(&SaslAuthRequest {
            mechanism: mech.name().to_string(),
            challenge: STANDARD.encode(mech.start(username, password)),
        })?;
        self.round_trip(request, "authenticate")?;
        debug!(user = username, mechanism = mech.name(), "authenticated");
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
        let request = Message::request(Opcode::CreateBucket).with_json(&CreateBucketRequest {
            name: name.to_string(),
            config: config.to_string(),
            bucket_type,
        })?;
        self.round_trip(request, "create bucket")?;
        Ok(())
    }

    fn delete_bucket(&mut self, name: &str) -> ClientResult<()> {
        self.core.require_authenticated("delete bucket")?;
        let request = Message::request(Opcode::DeleteBucket).with_json(&BucketName {
            name: name.to_string(),
        })?;
        self.round_trip(request, "delete bucket")?;
        Ok(())
    }

    fn select_bucket(&mut self, name: &str) -> ClientResult<()> {
        self.core.require_authenticated("select bucket")?;
        let request = Message::request(Opcode::SelectBucket).with_json(&BucketName {
            name: name.to_string(),
        })?;
        self.round_trip(request, "select bucket")?;
        self.core.set_state(ConnectionState::BucketSelected);
        Ok(())
    }

    fn list_buckets(&mut self) -> ClientResult<Vec<String>> {
        self.core.require_authenticated("list buckets")?;
        let response = self.round_trip(Message::request(Opcode::ListBuckets), "list buckets")?;
        let list: ListBucketsResponse = response.json()?;
        Ok(list.buckets)
    }

    fn get(&mut self, id: &str, vbucket: u16) -> ClientResult<Document> {
        self.core.require_authenticated("get")?;
        let mut request =
            Message::request(Opcode::Get).with_json(&GetRequest { id: id.to_string() })?;
        request.flex.set_vbucket(vbucket);
        let response = self.round_trip(request, "get")?;
        let (info, value): (DocumentInfo, &[u8]) = greenstack::decode_document(&response.payload)?;
        Ok(Document {
            info,
            value: value.to_vec(),
        })
    }

    fn mutate(
        &mut self,
        doc: &Document,
        vbucket: u16,
        mutation_type: MutationType,
    ) -> ClientResult<MutationInfo> {
        self.core.require_authenticated("mutate")?;
        parse_expiration(&doc.info.expiration)?;
        let meta = MutationMeta {
            info: doc.info.clone(),
            operation: mutation_type,
        };
        let value: &[u8] = if mutation_type == MutationType::Delete {
            &[]
        } else {
            &doc.value
        };
        let mut request = Message::request(Opcode::Mutation)
            .with_payload(greenstack::encode_document(&meta, value)?);
        request.flex.set_vbucket(vbucket);
        let response = self.round_trip(request, "mutate")?;
        Ok(response.json()?)
    }

    fn stats(&mut self, subcommand: &str) -> ClientResult<serde_json::Value> {
        self.core.require_synchronous()?;
        let request = Message::request(Opcode::Stats).with_json(&StatsRequest {
            group: subcommand.to_string(),
        })?;
        let response = self.round_trip(request, "stats")?;
        if response.payload.is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        Ok(response.json()?)
    }

    fn reload_audit_configuration(&mut self) -> ClientResult<()> {
        self.core.require_authenticated("audit reload")?;
        self.round_trip(Message::request(Opcode::AuditReload), "audit reload")?;
        Ok(())
    }

    fn encode_cmd_get(&mut self, id: &str, vbucket: u16) -> ClientResult<Frame> {
        let mut request =
            Message::request(Opcode::Get).with_json(&GetRequest { id: id.to_string() })?;
        request.flex.set_vbucket(vbucket);
        self.encode(request)
    }

    fn encode_cmd_dcp_open(&mut self) -> ClientResult<Frame> {
        let request = Message::request(Opcode::DcpOpen).with_json(&DcpOpenRequest {
            name: "dcp".to_string(),
            flags: DCP_OPEN_PRODUCER,
        })?;
        self.encode(request)
    }

    fn encode_cmd_dcp_stream_req(&mut self) -> ClientResult<Frame> {
        let mut request = Message::request(Opcode::DcpStreamReq).with_json(&DcpStreamRequest {
            flags: 0,
            start_seqno: 0,
            end_seqno: u64::MAX,
            vbucket_uuid: 0,
            snapshot_start: 0,
            snapshot_end: 0,
        })?;
        request.flex.set_vbucket(0);
        self.encode(request)
    }

    fn configure_ewouldblock_engine(
        &mut self,
        _mode: EwbEngineMode,
        _err_code: u32,
        _value: u32,
        _key: &str,
    ) -> ClientResult<()> {
        Err(ClientError::NotSupported("ewouldblock control over Greenstack"))
    }

    fn send_frame(&mut self, frame: &Frame) -> ClientResult<()> {
        self.core.send(frame.as_slice())
    }

    fn recv_frame(&mut self, frame: &mut Frame) -> ClientResult<()> {
        frame.reset();
        self.core.read_into(frame, LENGTH_PREFIX)?;
        let total = greenstack::frame_length(frame.as_slice())?;
        self.core.read_into(frame, total - LENGTH_PREFIX)?;
        trace!(len = total, "received message");
        Ok(())
    }
}

impl fmt::Display for GreenstackConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.core, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> GreenstackConnection {
        GreenstackConnection::new(
            "127.0.0.1",
            11211,
            AddressFamily::Inet,
            false,
            ConnectionOptions::default(),
        )
    }

    #[test]
    fn rejects_asynchronous_mode() {
        let mut conn = connection();
        assert!(matches!(
            conn.set_synchronous(false),
            Err(ClientError::NotSupported(_))
        ));
        assert!(conn.is_synchronous());
        assert!(conn.set_synchronous(true).is_ok());
    }

    #[test]
    fn encoded_get_has_vbucket_and_id() {
        let mut conn = connection();
        let frame = conn.encode_cmd_get("doc-1", 9).unwrap();
        let message = Message::decode(frame.as_slice()).unwrap();
        assert_eq!(message.opcode, Opcode::Get.as_u16());
        assert!(!message.is_response());
        assert_eq!(message.flex.vbucket(), Some(9));
        let request: GetRequest = message.json().unwrap();
        assert_eq!(request.id, "doc-1");
    }

    #[test]
    fn dcp_encoders() {
        let mut conn = connection();
        let open = Message::decode(conn.encode_cmd_dcp_open().unwrap().as_slice()).unwrap();
        let open: DcpOpenRequest = open.json().unwrap();
        assert_eq!(open.flags, DCP_OPEN_PRODUCER);

        let stream = Message::decode(conn.encode_cmd_dcp_stream_req().unwrap().as_slice()).unwrap();
        let stream: DcpStreamRequest = stream.json().unwrap();
        assert_eq!(stream.end_seqno, u64::MAX);
    }

    #[test]
    fn ioctl_uses_default_rejection() {
        let mut conn = connection();
        let err = conn.ioctl_get("release_free_memory").unwrap_err();
        assert!(err.is_invalid_arguments());
        assert!(conn.ioctl_set("tcmalloc.aggressive_memory_decommit", "0").is_err());
    }

    #[test]
    fn ewouldblock_control_is_unsupported() {
        let mut conn = connection();
        let err = conn
            .configure_ewouldblock_engine(EwbEngineMode::First, 0, 0, "")
            .unwrap_err();
        assert!(matches!(err, ClientError::NotSupported(_)));
    }
}
