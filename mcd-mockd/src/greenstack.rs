//! Greenstack front-end of the mock server.
//!
//! Same store as the binary front-end; requests and replies carry JSON
//! payloads, documents use the length-prefixed metadata layout.

use std::io;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mcd_common::greenstack::payload::{
    BucketName, CreateBucketRequest, GetRequest, HelloResponse, ListBucketsResponse,
    MutationMeta, SaslAuthRequest, SaslAuthResponse, StatsRequest,
};
use mcd_common::greenstack::{self, Message, Opcode, Status, LENGTH_PREFIX};
use mcd_common::mcbp::{DATATYPE_JSON, DATATYPE_SNAPPY};
use mcd_common::{sasl, Compression, Datatype, DocumentInfo, MutationInfo, MutationType};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use crate::store::{Mutation, ServerState, Session, StoreError};

/// Serves Greenstack requests until the peer disconnects.
pub async fn handle_connection<S>(mut stream: S, state: Arc<ServerState>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = Session::default();
    let mut buffer = vec![0u8; LENGTH_PREFIX];

    loop {
        buffer.resize(LENGTH_PREFIX, 0);
        match stream.read_exact(&mut buffer).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
        let total = match greenstack::frame_length(&buffer) {
            Ok(total) => total,
            Err(err) => {
                warn!(error = %err, "dropping connection after invalid length prefix");
                return Ok(());
            }
        };
        buffer.resize(total, 0);
        stream.read_exact(&mut buffer[LENGTH_PREFIX..]).await?;

        let request = match Message::decode(&buffer) {
            Ok(request) if !request.is_response() => request,
            Ok(_) => {
                warn!("dropping connection after unsolicited response");
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "dropping connection after malformed message");
                return Ok(());
            }
        };
        trace!(opcode = request.opcode, len = total, "request");

        let reply = dispatch(&request, &mut session, &state).with_opaque(request.opaque);
        let mut frame = mcd_common::Frame::new();
        if let Err(err) = reply.encode(&mut frame) {
            warn!(error = %err, "failed to encode reply");
            return Ok(());
        }
        stream.write_all(frame.as_slice()).await?;
        stream.flush().await?;
    }
}

type Reply = Result<Message, u16>;

fn status_of(err: StoreError) -> u16 {
    let status = match err {
        StoreError::NotFound => Status::NotFound,
        StoreError::Exists => Status::AlreadyExists,
        StoreError::NotStored => Status::NotStored,
        StoreError::NotMyVbucket => Status::NotMyVBucket,
        StoreError::InvalidArguments => Status::InvalidArguments,
        StoreError::NoBucket => Status::InvalidState,
        StoreError::NoAccess => Status::NoAccess,
        StoreError::AuthFailed => Status::AuthenticationError,
        StoreError::NotSupported => Status::NotImplemented,
        StoreError::Injected(_) => Status::TmpFailure,
    };
    status.as_u16()
}

fn parse<T: DeserializeOwned>(request: &Message) -> Result<T, u16> {
    request
        .json()
        .map_err(|_| Status::InvalidArguments.as_u16())
}

fn ok(request: &Message) -> Message {
    Message::response(request.opcode, Status::Success.as_u16())
}

fn ok_json<T: Serialize>(request: &Message, value: &T) -> Reply {
    ok(request)
        .with_json(value)
        .map_err(|_| Status::InternalError.as_u16())
}

fn dispatch(request: &Message, session: &mut Session, state: &ServerState) -> Message {
    let result = match Opcode::from_u16(request.opcode) {
        None => Err(Status::UnknownCommand.as_u16()),
        Some(Opcode::Noop) => Ok(ok(request)),
        Some(Opcode::Hello) => ok_json(
            request,
            &HelloResponse {
                server: "mcd-mockd".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                sasl_mechanisms: "PLAIN".to_string(),
            },
        ),
        Some(Opcode::SaslAuth) => handle_sasl_auth(request, session, state),
        Some(Opcode::CreateBucket) => parse::<CreateBucketRequest>(request).and_then(|req| {
            state
                .create_bucket(session, &req.name, req.bucket_type)
                .map(|_| ok(request))
                .map_err(status_of)
        }),
        Some(Opcode::DeleteBucket) => parse::<BucketName>(request).and_then(|req| {
            state
                .delete_bucket(session, &req.name)
                .map(|_| ok(request))
                .map_err(status_of)
        }),
        Some(Opcode::SelectBucket) => parse::<BucketName>(request).and_then(|req| {
            state
                .select_bucket(session, &req.name)
                .map(|_| ok(request))
                .map_err(status_of)
        }),
        Some(Opcode::ListBuckets) => state
            .list_buckets(session)
            .map_err(status_of)
            .and_then(|buckets| ok_json(request, &ListBucketsResponse { buckets })),
        Some(Opcode::Get) => handle_get(request, session, state),
        Some(Opcode::Mutation) => handle_mutation(request, session, state),
        Some(Opcode::Stats) => handle_stats(request, state),
        Some(Opcode::AuditReload) => state
            .reload_audit(session)
            .map(|_| ok(request))
            .map_err(status_of),
        Some(Opcode::DcpOpen) | Some(Opcode::DcpStreamReq) => {
            Err(Status::NotImplemented.as_u16())
        }
    };

    match result {
        Ok(reply) => reply,
        Err(status) => Message::response(request.opcode, status),
    }
}

fn handle_sasl_auth(request: &Message, session: &mut Session, state: &ServerState) -> Reply {
    let denied = Status::AuthenticationError.as_u16();
    let req: SaslAuthRequest = parse(request)?;
    if !req.mechanism.eq_ignore_ascii_case("PLAIN") {
        return Err(denied);
    }
    let challenge = STANDARD.decode(req.challenge).map_err(|_| denied)?;
    let (_, user, password) = sasl::decode_plain(&challenge).ok_or(denied)?;
    state
        .authenticate(session, user, password)
        .map_err(status_of)?;
    ok_json(request, &SaslAuthResponse::default())
}

fn handle_get(request: &Message, session: &mut Session, state: &ServerState) -> Reply {
    let req: GetRequest = parse(request)?;
    let vbucket = request.flex.vbucket().unwrap_or(0);
    let item = state.get(session, &req.id, vbucket).map_err(status_of)?;

    let info = DocumentInfo {
        id: req.id,
        flags: item.flags,
        expiration: String::new(),
        compression: if item.datatype & DATATYPE_SNAPPY != 0 {
            Compression::Snappy
        } else {
            Compression::None
        },
        datatype: if item.datatype & DATATYPE_JSON != 0 {
            Datatype::Json
        } else {
            Datatype::Raw
        },
        cas: item.cas,
    };
    let payload = greenstack::encode_document(&info, &item.value)
        .map_err(|_| Status::InternalError.as_u16())?;
    Ok(ok(request).with_payload(payload))
}

fn handle_mutation(request: &Message, session: &mut Session, state: &ServerState) -> Reply {
    let invalid = Status::InvalidArguments.as_u16();
    let (meta, value): (MutationMeta, &[u8]) =
        greenstack::decode_document(&request.payload).map_err(|_| invalid)?;
    if !meta.info.expiration.is_empty() && meta.info.expiration.parse::<u32>().is_err() {
        return Err(invalid);
    }

    let mut datatype = 0;
    if meta.info.datatype == Datatype::Json {
        datatype |= DATATYPE_JSON;
    }
    if meta.info.compression == Compression::Snappy {
        datatype |= DATATYPE_SNAPPY;
    }

    let stored = state
        .mutate(
            session,
            &Mutation {
                operation: meta.operation,
                key: &meta.info.id,
                value,
                flags: meta.info.flags,
                datatype,
                cas: meta.info.cas,
                vbucket: request.flex.vbucket().unwrap_or(0),
            },
        )
        .map_err(status_of)?;

    let size = if meta.operation == MutationType::Delete {
        0
    } else {
        value.len()
    };
    ok_json(
        request,
        &MutationInfo {
            cas: stored.cas,
            size,
            seqno: stored.seqno,
            vbucket_uuid: stored.vbucket_uuid,
        },
    )
}

fn handle_stats(request: &Message, state: &ServerState) -> Reply {
    let req: StatsRequest = if request.payload.is_empty() {
        StatsRequest::default()
    } else {
        parse(request)?
    };
    let entries = state.stats(&req.group).map_err(status_of)?;
    let object: serde_json::Map<String, serde_json::Value> = entries
        .into_iter()
        .map(|(key, value)| (key, serde_json::Value::String(value)))
        .collect();
    ok_json(request, &object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcd_common::greenstack::payload::HelloRequest;

    fn plain_challenge(user: &str, password: &str) -> String {
        STANDARD.encode(sasl::mechanism("PLAIN").unwrap().start(user, password))
    }

    fn login(state: &ServerState, session: &mut Session, user: &str, password: &str) -> Message {
        let request = Message::request(Opcode::SaslAuth)
            .with_json(&SaslAuthRequest {
                mechanism: "PLAIN".to_string(),
                challenge: plain_challenge(user, password),
            })
            .unwrap();
        dispatch(&request, session, state)
    }

    #[test]
    fn hello_lists_plain() {
        let state = ServerState::new();
        let mut session = Session::default();
        let request = Message::request(Opcode::Hello)
            .with_json(&HelloRequest::default())
            .unwrap();
        let reply = dispatch(&request, &mut session, &state);
        assert!(reply.is_response());
        let hello: HelloResponse = reply.json().unwrap();
        assert_eq!(hello.sasl_mechanisms, "PLAIN");
    }

    #[test]
    fn sasl_auth_checks_password() {
        let state = ServerState::new();
        let mut session = Session::default();
        let reply = login(&state, &mut session, "bucket-1", "wrong");
        assert_eq!(reply.status, Status::AuthenticationError.as_u16());
        assert!(session.user.is_none());

        let reply = login(&state, &mut session, "bucket-1", "1S|=,%#x1");
        assert!(reply.is_success());
        assert_eq!(session.user.as_deref(), Some("bucket-1"));
    }

    #[test]
    fn get_without_bucket_is_invalid_state() {
        let state = ServerState::new();
        let mut session = Session::default();
        assert!(login(&state, &mut session, "bucket-1", "1S|=,%#x1").is_success());
        let mut request = Message::request(Opcode::Get)
            .with_json(&GetRequest { id: "k".to_string() })
            .unwrap();
        request.flex.set_vbucket(0);
        let reply = dispatch(&request, &mut session, &state);
        assert_eq!(reply.status, Status::InvalidState.as_u16());
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let state = ServerState::new();
        let mut session = Session::default();
        let mut request = Message::request(Opcode::Noop);
        request.opcode = 0x7777;
        let reply = dispatch(&request, &mut session, &state);
        assert_eq!(reply.status, Status::UnknownCommand.as_u16());
        assert_eq!(reply.opcode, 0x7777);
    }
}
