#![allow(dead_code)]

use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mcd_client::{
    new_connection, AddressFamily, ConnectionOptions, MemcachedConnection, Protocol,
};
use mcd_mockd::{MockConfig, MockServer};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

pub const BUCKET: &str = "bucket-1";
pub const BUCKET_PASSWORD: &str = "1S|=,%#x1";
pub const ADMIN: &str = "_admin";
pub const ADMIN_PASSWORD: &str = "password";

pub fn options() -> ConnectionOptions {
    ConnectionOptions::default().with_timeout(Duration::from_secs(5))
}

pub fn start_plain() -> MockServer {
    mcd_mockd::init_tracing();
    MockServer::start(MockConfig::default()).expect("start mock server")
}

/// Starts a server with TLS ports and returns client options trusting it.
pub fn start_tls() -> (MockServer, ConnectionOptions) {
    mcd_mockd::init_tracing();
    let cert = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])
    .expect("generate certificate");
    let der = CertificateDer::from(cert.cert);
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()));

    let server_tls = mcd_mockd::server_config_from_der(vec![der.clone()], key).expect("server tls");
    let server =
        MockServer::start(MockConfig::default().with_tls(server_tls)).expect("start mock server");
    let client_tls: Arc<rustls::ClientConfig> =
        mcd_client::tls::client_config_from_certs([der]).expect("client tls");
    (server, options().with_tls(client_tls))
}

pub fn connect(
    server: &MockServer,
    protocol: Protocol,
    ssl: bool,
    options: ConnectionOptions,
) -> Box<dyn MemcachedConnection> {
    let port = server.port(protocol, ssl).expect("port announced");
    let mut conn = new_connection("127.0.0.1", port, AddressFamily::Inet, ssl, protocol, options);
    conn.connect().expect("connect");
    conn
}

/// Connects, says hello, authenticates and selects `bucket`.
pub fn login(
    server: &MockServer,
    protocol: Protocol,
    user: &str,
    password: &str,
    bucket: Option<&str>,
) -> Box<dyn MemcachedConnection> {
    let mut conn = connect(server, protocol, false, options());
    conn.hello("mcd-client-tests", "1.0", "integration").expect("hello");
    conn.authenticate(user, password, "PLAIN").expect("authenticate");
    if let Some(bucket) = bucket {
        conn.select_bucket(bucket).expect("select bucket");
    }
    conn
}

/// A one-shot listener that writes `bytes` to the first client and hangs up.
pub fn truncating_peer(bytes: Vec<u8>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream.write_all(&bytes).expect("write");
    });
    (port, handle)
}

/// Connects to a `truncating_peer`.
pub fn connect_raw(port: u16, protocol: Protocol) -> Box<dyn MemcachedConnection> {
    let mut conn =
        new_connection("127.0.0.1", port, AddressFamily::Inet, false, protocol, options());
    conn.connect().expect("connect");
    conn
}
