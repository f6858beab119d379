//! Binary protocol front-end of the mock server.
//!
//! Reads one 24 byte header plus body at a time, dispatches on the opcode and
//! writes the response(s) before reading the next request.

use std::io;
use std::sync::Arc;

use mcd_common::mcbp::{
    self, Feature, Opcode, RequestHeader, ResponseHeader, Status, HEADER_SIZE, RESPONSE_MAGIC,
};
use mcd_common::{sasl, BucketType, MutationType};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::store::{Mutation, ServerState, Session, StoreError};

/// Features the mock agrees to in HELLO.
const SUPPORTED_FEATURES: [Feature; 3] =
    [Feature::Datatype, Feature::TcpNodelay, Feature::MutationSeqno];

/// Serves binary protocol requests until the peer disconnects.
pub async fn handle_connection<S>(mut stream: S, state: Arc<ServerState>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::default();
    let mut header = [0u8; HEADER_SIZE];
    let mut out = Vec::with_capacity(256);

    loop {
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let request = match RequestHeader::parse(&header) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "dropping connection after invalid header");
                return Ok(());
            }
        };
        let body_len = match mcbp::frame_length(&header) {
            Ok(total) => total - HEADER_SIZE,
            Err(err) => {
                warn!(error = %err, "dropping connection after oversized request");
                return Ok(());
            }
        };
        let mut body = vec![0u8; body_len];
        stream.read_exact(&mut body).await?;
        trace!(opcode = request.opcode, len = body_len, "request");

        out.clear();
        dispatch(&Packet { header: request, body: &body }, &mut session, &state, &mut out);
        stream.write_all(&out).await?;
        stream.flush().await?;
    }
}

struct Packet<'a> {
    header: RequestHeader,
    body: &'a [u8],
}

impl Packet<'_> {
    fn extras(&self) -> &[u8] {
        &self.body[..self.header.extras_length as usize]
    }

    fn key(&self) -> &[u8] {
        let start = self.header.extras_length as usize;
        &self.body[start..start + self.header.key_length as usize]
    }

    fn value(&self) -> &[u8] {
        let start = self.header.extras_length as usize + self.header.key_length as usize;
        &self.body[start..]
    }

    fn key_str(&self) -> Result<&str, u16> {
        std::str::from_utf8(self.key()).map_err(|_| Status::InvalidArguments.as_u16())
    }
}

#[derive(Default)]
struct Reply {
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
    datatype: u8,
    cas: u64,
}

impl Reply {
    fn value(value: impl Into<Vec<u8>>) -> Self {
        Reply {
            value: value.into(),
            ..Reply::default()
        }
    }
}

fn status_of(err: StoreError) -> u16 {
    let status = match err {
        StoreError::NotFound => Status::KeyNotFound,
        StoreError::Exists => Status::KeyExists,
        StoreError::NotStored => Status::NotStored,
        StoreError::NotMyVbucket => Status::NotMyVbucket,
        StoreError::InvalidArguments => Status::InvalidArguments,
        StoreError::NoBucket => Status::NoBucket,
        StoreError::NoAccess => Status::AccessDenied,
        StoreError::AuthFailed => Status::AuthError,
        StoreError::NotSupported => Status::NotSupported,
        StoreError::Injected(raw) => return raw,
    };
    status.as_u16()
}

fn write_response(out: &mut Vec<u8>, request: &RequestHeader, status: u16, reply: &Reply) {
    ResponseHeader {
        magic: RESPONSE_MAGIC,
        opcode: request.opcode,
        key_length: reply.key.len() as u16,
        extras_length: reply.extras.len() as u8,
        datatype: reply.datatype,
        status,
        total_body_length: (reply.extras.len() + reply.key.len() + reply.value.len()) as u32,
        opaque: request.opaque,
        cas: reply.cas,
    }
    .encode(out);
    out.extend_from_slice(&reply.extras);
    out.extend_from_slice(&reply.key);
    out.extend_from_slice(&reply.value);
}

fn dispatch(packet: &Packet<'_>, session: &mut Session, state: &ServerState, out: &mut Vec<u8>) {
    let Some(opcode) = Opcode::from_u8(packet.header.opcode) else {
        write_response(
            out,
            &packet.header,
            Status::UnknownCommand.as_u16(),
            &Reply::default(),
        );
        return;
    };

    if opcode == Opcode::Stat {
        handle_stat(packet, state, out);
        return;
    }

    let result = match opcode {
        Opcode::Noop => Ok(Reply::default()),
        Opcode::Hello => Ok(handle_hello(packet, session)),
        Opcode::SaslListMechs => Ok(Reply::value("PLAIN")),
        Opcode::SaslAuth => handle_sasl_auth(packet, session, state),
        Opcode::SaslStep => Err(Status::AuthError.as_u16()),
        Opcode::CreateBucket => handle_create_bucket(packet, session, state),
        Opcode::DeleteBucket => packet
            .key_str()
            .and_then(|name| state.delete_bucket(session, name).map_err(status_of))
            .map(|_| Reply::default()),
        Opcode::SelectBucket => packet
            .key_str()
            .and_then(|name| state.select_bucket(session, name).map_err(status_of))
            .map(|_| Reply::default()),
        Opcode::ListBuckets => state
            .list_buckets(session)
            .map(|names| Reply::value(names.join(" ")))
            .map_err(status_of),
        Opcode::Get => handle_get(packet, session, state),
        Opcode::Set
        | Opcode::Add
        | Opcode::Replace
        | Opcode::Append
        | Opcode::Prepend
        | Opcode::Delete => handle_mutation(opcode, packet, session, state),
        Opcode::AuditConfigReload => state
            .reload_audit(session)
            .map(|_| Reply::default())
            .map_err(status_of),
        Opcode::IoctlGet => packet
            .key_str()
            .and_then(|key| state.ioctl_get(session, key).map_err(status_of))
            .map(Reply::value),
        Opcode::IoctlSet => handle_ioctl_set(packet, session, state),
        Opcode::EwouldblockCtl => handle_ewouldblock(packet, session, state),
        Opcode::DcpOpen | Opcode::DcpStreamReq | Opcode::Stat => {
            Err(Status::NotSupported.as_u16())
        }
    };

    match result {
        Ok(reply) => write_response(out, &packet.header, Status::Success.as_u16(), &reply),
        Err(status) => write_response(out, &packet.header, status, &Reply::default()),
    }
}

fn handle_hello(packet: &Packet<'_>, session: &mut Session) -> Reply {
    let mut accepted = Vec::new();
    session.mutation_seqno = false;
    for chunk in packet.value().chunks_exact(2) {
        let code = u16::from_be_bytes([chunk[0], chunk[1]]);
        let Some(feature) = Feature::from_u16(code) else {
            continue;
        };
        if SUPPORTED_FEATURES.contains(&feature) {
            accepted.extend_from_slice(&code.to_be_bytes());
            if feature == Feature::MutationSeqno {
                session.mutation_seqno = true;
            }
        }
    }
    Reply::value(accepted)
}

fn handle_sasl_auth(
    packet: &Packet<'_>,
    session: &mut Session,
    state: &ServerState,
) -> Result<Reply, u16> {
    let denied = Status::AuthError.as_u16();
    if !packet.key().eq_ignore_ascii_case(b"PLAIN") {
        return Err(denied);
    }
    let (_, user, password) = sasl::decode_plain(packet.value()).ok_or(denied)?;
    state
        .authenticate(session, user, password)
        .map_err(status_of)?;
    Ok(Reply::value("Authenticated"))
}

fn handle_create_bucket(
    packet: &Packet<'_>,
    session: &mut Session,
    state: &ServerState,
) -> Result<Reply, u16> {
    let invalid = Status::InvalidArguments.as_u16();
    let name = packet.key_str()?;
    let value = packet.value();
    let module_end = value.iter().position(|b| *b == 0).unwrap_or(value.len());
    let module = &value[..module_end];
    let bucket_type = [
        BucketType::Memcached,
        BucketType::Couchbase,
        BucketType::EWouldBlock,
    ]
    .into_iter()
    .find(|t| mcbp::bucket_module(*t).as_bytes() == module)
    .ok_or(invalid)?;
    state
        .create_bucket(session, name, bucket_type)
        .map_err(status_of)?;
    Ok(Reply::default())
}

fn handle_get(
    packet: &Packet<'_>,
    session: &mut Session,
    state: &ServerState,
) -> Result<Reply, u16> {
    let key = packet.key_str()?;
    let item = state
        .get(session, key, packet.header.vbucket)
        .map_err(status_of)?;
    Ok(Reply {
        extras: item.flags.to_be_bytes().to_vec(),
        key: Vec::new(),
        value: item.value,
        datatype: item.datatype,
        cas: item.cas,
    })
}

fn handle_mutation(
    opcode: Opcode,
    packet: &Packet<'_>,
    session: &mut Session,
    state: &ServerState,
) -> Result<Reply, u16> {
    let invalid = Status::InvalidArguments.as_u16();
    let operation = match opcode {
        Opcode::Set => MutationType::Set,
        Opcode::Add => MutationType::Add,
        Opcode::Replace => MutationType::Replace,
        Opcode::Append => MutationType::Append,
        Opcode::Prepend => MutationType::Prepend,
        _ => MutationType::Delete,
    };
    let extras = packet.extras();
    let flags = match operation {
        MutationType::Set | MutationType::Add | MutationType::Replace => {
            if extras.len() != 8 {
                return Err(invalid);
            }
            mcbp::read_u32(extras)
        }
        _ => {
            if !extras.is_empty() {
                return Err(invalid);
            }
            0
        }
    };

    let stored = state
        .mutate(
            session,
            &Mutation {
                operation,
                key: packet.key_str()?,
                value: packet.value(),
                flags,
                datatype: packet.header.datatype,
                cas: packet.header.cas,
                vbucket: packet.header.vbucket,
            },
        )
        .map_err(status_of)?;

    let mut reply = Reply {
        cas: stored.cas,
        ..Reply::default()
    };
    if session.mutation_seqno {
        reply.extras.extend_from_slice(&stored.vbucket_uuid.to_be_bytes());
        reply.extras.extend_from_slice(&stored.seqno.to_be_bytes());
    }
    Ok(reply)
}

fn handle_stat(packet: &Packet<'_>, state: &ServerState, out: &mut Vec<u8>) {
    let group = match packet.key_str() {
        Ok(group) => group,
        Err(status) => {
            write_response(out, &packet.header, status, &Reply::default());
            return;
        }
    };
    match state.stats(group) {
        Ok(entries) => {
            for (key, value) in entries {
                let reply = Reply {
                    key: key.into_bytes(),
                    value: value.into_bytes(),
                    ..Reply::default()
                };
                write_response(out, &packet.header, Status::Success.as_u16(), &reply);
            }
            write_response(out, &packet.header, Status::Success.as_u16(), &Reply::default());
        }
        Err(err) => write_response(out, &packet.header, status_of(err), &Reply::default()),
    }
}

fn handle_ioctl_set(
    packet: &Packet<'_>,
    session: &mut Session,
    state: &ServerState,
) -> Result<Reply, u16> {
    let key = packet.key_str()?;
    let value =
        std::str::from_utf8(packet.value()).map_err(|_| Status::InvalidArguments.as_u16())?;
    state.ioctl_set(session, key, value).map_err(status_of)?;
    Ok(Reply::default())
}

fn handle_ewouldblock(
    packet: &Packet<'_>,
    session: &mut Session,
    state: &ServerState,
) -> Result<Reply, u16> {
    let invalid = Status::InvalidArguments.as_u16();
    let extras = packet.extras();
    if extras.len() != 12 {
        return Err(invalid);
    }
    let mode = mcbp::read_u32(&extras[0..4]);
    let value = mcbp::read_u32(&extras[4..8]);
    let status = u16::try_from(mcbp::read_u32(&extras[8..12])).map_err(|_| invalid)?;
    state
        .configure_ewouldblock(session, mode, value, status)
        .map_err(status_of)?;
    Ok(Reply::default())
}
