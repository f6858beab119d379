mod common;

use mcd_client::{
    BucketType, ClientError, ConnectionState, Datatype, Document, EwbEngineMode, Frame,
    MutationType, Protocol,
};
use mcd_common::greenstack::{Message, Status};

use common::{ADMIN, ADMIN_PASSWORD, BUCKET, BUCKET_PASSWORD};

#[test]
fn hello_reports_plain() {
    let server = common::start_plain();
    let mut conn = common::connect(&server, Protocol::Greenstack, false, common::options());
    assert!(conn.sasl_mechanisms().is_empty());
    conn.hello("mcd-client-tests", "1.0", "").expect("hello");
    assert_eq!(conn.sasl_mechanisms(), ["PLAIN".to_string()]);
}

#[test]
fn documents_round_trip() {
    let server = common::start_plain();
    let mut conn =
        common::login(&server, Protocol::Greenstack, BUCKET, BUCKET_PASSWORD, Some(BUCKET));
    assert_eq!(conn.state(), ConnectionState::BucketSelected);

    let mut doc = Document::new("profile", b"{\"age\":42}".to_vec());
    doc.info.flags = 7;
    doc.info.datatype = Datatype::Json;
    let info = conn.mutate(&doc, 3, MutationType::Set).expect("set");
    assert_ne!(info.cas, 0);
    assert_eq!(info.size, doc.value.len());

    let stored = conn.get("profile", 3).expect("get");
    assert_eq!(stored.value, doc.value);
    assert_eq!(stored.info.id, "profile");
    assert_eq!(stored.info.flags, 7);
    assert_eq!(stored.info.datatype, Datatype::Json);
    assert_eq!(stored.info.cas, info.cas);
}

#[test]
fn failures_use_greenstack_codes() {
    let server = common::start_plain();
    let mut conn =
        common::login(&server, Protocol::Greenstack, BUCKET, BUCKET_PASSWORD, Some(BUCKET));

    let err = conn.get("absent", 0).unwrap_err();
    assert!(err.is_not_found());
    let conn_err = err.connection_error().expect("server rejection");
    assert_eq!(conn_err.protocol(), Protocol::Greenstack);
    assert_eq!(conn_err.reason(), Status::NotFound.as_u16());

    let doc = Document::new("k", b"v".to_vec());
    conn.mutate(&doc, 0, MutationType::Add).expect("add");
    assert!(conn.mutate(&doc, 0, MutationType::Add).unwrap_err().is_already_exists());
    assert!(conn.mutate(&doc, 900, MutationType::Set).unwrap_err().is_not_my_vbucket());
    assert!(conn.get("k", 600).unwrap_err().is_not_my_vbucket());

    let mut bad = doc.clone();
    bad.info.expiration = "tomorrow".to_string();
    assert!(conn.mutate(&bad, 0, MutationType::Set).unwrap_err().is_invalid_arguments());
}

#[test]
fn access_is_enforced() {
    let server = common::start_plain();
    let mut conn = common::connect(&server, Protocol::Greenstack, false, common::options());
    assert!(conn.list_buckets().unwrap_err().is_access_denied());
    assert!(conn
        .authenticate(BUCKET, "wrong", "PLAIN")
        .unwrap_err()
        .is_access_denied());

    conn.authenticate(BUCKET, BUCKET_PASSWORD, "PLAIN").expect("authenticate");
    assert!(conn.select_bucket("bucket-2").unwrap_err().is_access_denied());
}

#[test]
fn bucket_management_as_admin() {
    let server = common::start_plain();
    let mut conn = common::login(&server, Protocol::Greenstack, ADMIN, ADMIN_PASSWORD, None);
    conn.create_bucket("gs-scratch", "", BucketType::Couchbase)
        .expect("create");
    let buckets = conn.list_buckets().expect("list");
    assert!(buckets.contains(&"gs-scratch".to_string()));
    assert!(buckets.contains(&"default".to_string()));
    conn.delete_bucket("gs-scratch").expect("delete");
    assert!(conn.delete_bucket("gs-scratch").unwrap_err().is_not_found());
}

#[test]
fn stats_and_audit() {
    let server = common::start_plain();
    let mut conn = common::login(&server, Protocol::Greenstack, ADMIN, ADMIN_PASSWORD, None);
    let stats = conn.stats("").expect("stats");
    assert!(stats.get("pid").is_some());
    conn.reload_audit_configuration().expect("audit reload");
    assert_eq!(server.audit_reloads(), 1);
}

#[test]
fn unsupported_operations() {
    let server = common::start_plain();
    let mut conn = common::login(&server, Protocol::Greenstack, ADMIN, ADMIN_PASSWORD, None);

    assert!(matches!(
        conn.set_synchronous(false),
        Err(ClientError::NotSupported(_))
    ));
    assert!(conn.ioctl_get("trace.config").unwrap_err().is_invalid_arguments());
    assert!(conn.ioctl_set("trace.config", "x").unwrap_err().is_invalid_arguments());
    assert!(matches!(
        conn.configure_ewouldblock_engine(EwbEngineMode::NextN, 0, 1, ""),
        Err(ClientError::NotSupported(_))
    ));
}

#[test]
fn raw_frames() {
    let server = common::start_plain();
    let mut conn =
        common::login(&server, Protocol::Greenstack, BUCKET, BUCKET_PASSWORD, Some(BUCKET));

    let mut frame = conn.encode_cmd_get("absent", 0).expect("encode");
    conn.send_partial_frame(&mut frame, 6).expect("first chunk");
    let rest = frame.len();
    conn.send_partial_frame(&mut frame, rest).expect("second chunk");

    let mut reply = Frame::new();
    conn.recv_frame(&mut reply).expect("recv");
    let message = Message::decode(reply.as_slice()).expect("decode");
    assert!(message.is_response());
    assert_eq!(message.status, Status::NotFound.as_u16());

    let frame = conn.encode_cmd_dcp_stream_req().expect("encode");
    conn.send_frame(&frame).expect("send");
    conn.recv_frame(&mut reply).expect("recv");
    let message = Message::decode(reply.as_slice()).expect("decode");
    assert_eq!(message.status, Status::NotImplemented.as_u16());
}

#[test]
fn short_read_is_a_transport_failure() {
    let (port, peer) = common::truncating_peer(vec![0x00, 0x00]);
    let mut conn = common::connect_raw(port, Protocol::Greenstack);
    peer.join().expect("peer");

    let mut reply = Frame::new();
    let err = conn.recv_frame(&mut reply).unwrap_err();
    assert!(matches!(err, ClientError::Io(_)));
    assert!(err.connection_error().is_none());
}
