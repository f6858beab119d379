//! # Connection Contract
//!
//! Purpose: Define the operations every protocol implementation offers, plus
//! the lifecycle state they share.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: One trait, one implementation per wire protocol,
//!    selected by `Protocol` in `new_connection`.
//! 2. **Shared Core**: Target parameters, transport, session state and the
//!    opaque counter live in `ConnectionCore`; implementations only encode
//!    and decode.
//! 3. **Explicit Lifecycle**: Unconnected -> Connected -> Authenticated ->
//!    BucketSelected. `close` and `reconnect` discard everything after it.

use std::fmt;

use mcd_common::{
    greenstack, mcbp, AddressFamily, BucketType, ConnectionError, Document, EwbEngineMode, Frame,
    MutationInfo, MutationType, Protocol, TransportKind,
};
use tracing::{debug, trace};

use crate::binprot::BinprotConnection;
use crate::config::ConnectionOptions;
use crate::error::{ClientError, ClientResult};
use crate::greenstack::GreenstackConnection;
use crate::transport::Transport;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Authenticated,
    BucketSelected,
}

/// Operations offered by a connection, independent of the wire protocol.
///
/// All operations block until the full response has been read. Failures are
/// either a server rejection (`ClientError::Connection`) or a generic error
/// after which the connection should be reconnected.
pub trait MemcachedConnection: fmt::Display + Send {
    fn core(&self) -> &ConnectionCore;

    fn core_mut(&mut self) -> &mut ConnectionCore;

    fn protocol(&self) -> Protocol {
        self.core().protocol
    }

    fn host(&self) -> &str {
        &self.core().host
    }

    fn port(&self) -> u16 {
        self.core().port
    }

    fn family(&self) -> AddressFamily {
        self.core().family
    }

    fn is_ssl(&self) -> bool {
        self.core().ssl
    }

    fn state(&self) -> ConnectionState {
        self.core().state
    }

    fn is_synchronous(&self) -> bool {
        self.core().synchronous
    }

    /// Switches between blocking round trips and pipelined requests.
    fn set_synchronous(&mut self, enable: bool) -> ClientResult<()>;

    /// Establishes the transport. Any previous session is discarded.
    fn connect(&mut self) -> ClientResult<()> {
        self.core_mut().connect()
    }

    /// Tears down the transport; the connection becomes Unconnected.
    fn close(&mut self) {
        self.core_mut().close();
    }

    /// `close` followed by `connect`.
    fn reconnect(&mut self) -> ClientResult<()> {
        self.close();
        self.connect()
    }

    /// A fresh, unconnected connection to the same target.
    fn clone_connection(&self) -> Box<dyn MemcachedConnection>;

    /// Mechanisms announced by the server during `hello`; empty before.
    fn sasl_mechanisms(&self) -> &[String] {
        &self.core().sasl_mechanisms
    }

    fn hello(
        &mut self,
        user_agent: &str,
        user_agent_version: &str,
        comment: &str,
    ) -> ClientResult<()>;

    fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        mechanism: &str,
    ) -> ClientResult<()>;

    fn create_bucket(
        &mut self,
        name: &str,
        config: &str,
        bucket_type: BucketType,
    ) -> ClientResult<()>;

    fn delete_bucket(&mut self, name: &str) -> ClientResult<()>;

    fn select_bucket(&mut self, name: &str) -> ClientResult<()>;

    fn list_buckets(&mut self) -> ClientResult<Vec<String>>;

    fn get(&mut self, id: &str, vbucket: u16) -> ClientResult<Document>;

    fn mutate(
        &mut self,
        doc: &Document,
        vbucket: u16,
        mutation_type: MutationType,
    ) -> ClientResult<MutationInfo>;

    /// Statistics for `subcommand` ("" for the default group) as a JSON object.
    fn stats(&mut self, subcommand: &str) -> ClientResult<serde_json::Value>;

    fn reload_audit_configuration(&mut self) -> ClientResult<()>;

    /// Encodes a get request without sending it.
    fn encode_cmd_get(&mut self, id: &str, vbucket: u16) -> ClientResult<Frame>;

    fn encode_cmd_dcp_open(&mut self) -> ClientResult<Frame>;

    fn encode_cmd_dcp_stream_req(&mut self) -> ClientResult<Frame>;

    /// Programs the ewouldblock test engine.
    fn configure_ewouldblock_engine(
        &mut self,
        mode: EwbEngineMode,
        err_code: u32,
        value: u32,
        key: &str,
    ) -> ClientResult<()>;

    fn ioctl_get(&mut self, key: &str) -> ClientResult<String> {
        Err(ClientError::InvalidArgument(format!(
            "ioctl_get({key}) is not supported by {}",
            self.protocol()
        )))
    }

    fn ioctl_set(&mut self, key: &str, _value: &str) -> ClientResult<()> {
        Err(ClientError::InvalidArgument(format!(
            "ioctl_set({key}) is not supported by {}",
            self.protocol()
        )))
    }

    /// Writes one complete frame.
    fn send_frame(&mut self, frame: &Frame) -> ClientResult<()>;

    /// Writes the first `length` bytes of `frame` and removes them from it.
    fn send_partial_frame(&mut self, frame: &mut Frame, length: usize) -> ClientResult<()> {
        if length > frame.len() {
            return Err(ClientError::InvalidArgument(format!(
                "cannot send {length} bytes of a {} byte frame",
                frame.len()
            )));
        }
        self.core_mut().send(&frame.as_slice()[..length])?;
        frame.consume(length);
        Ok(())
    }

    /// Replaces `frame` with the next complete unit read from the server.
    fn recv_frame(&mut self, frame: &mut Frame) -> ClientResult<()>;
}

/// Creates an unconnected connection speaking `protocol`.
pub fn new_connection(
    host: impl Into<String>,
    port: u16,
    family: AddressFamily,
    ssl: bool,
    protocol: Protocol,
    options: ConnectionOptions,
) -> Box<dyn MemcachedConnection> {
    let core = ConnectionCore::new(host, port, family, ssl, protocol, options);
    match protocol {
        Protocol::Memcached => Box::new(BinprotConnection::from_core(core)),
        Protocol::Greenstack => Box::new(GreenstackConnection::from_core(core)),
    }
}

/// State shared by both protocol implementations.
pub struct ConnectionCore {
    host: String,
    port: u16,
    family: AddressFamily,
    ssl: bool,
    protocol: Protocol,
    options: ConnectionOptions,
    transport: Option<Transport>,
    state: ConnectionState,
    synchronous: bool,
    sasl_mechanisms: Vec<String>,
    next_opaque: u32,
}

impl ConnectionCore {
    pub(crate) fn new(
        host: impl Into<String>,
        port: u16,
        family: AddressFamily,
        ssl: bool,
        protocol: Protocol,
        options: ConnectionOptions,
    ) -> Self {
        ConnectionCore {
            host: host.into(),
            port,
            family,
            ssl,
            protocol,
            options,
            transport: None,
            state: ConnectionState::Unconnected,
            synchronous: true,
            sasl_mechanisms: Vec::new(),
            next_opaque: 1,
        }
    }

    /// Same target and options, no transport or session.
    pub(crate) fn clone_target(&self) -> Self {
        ConnectionCore::new(
            self.host.clone(),
            self.port,
            self.family,
            self.ssl,
            self.protocol,
            self.options.clone(),
        )
    }

    pub fn transport_kind(&self) -> TransportKind {
        TransportKind::new(self.ssl, self.family)
    }

    pub(crate) fn connect(&mut self) -> ClientResult<()> {
        self.close();
        let transport =
            Transport::connect(&self.host, self.port, self.family, self.ssl, &self.options)?;
        debug!(
            protocol = %self.protocol,
            transport = %self.transport_kind(),
            peer = %transport.peer(),
            "connected"
        );
        self.transport = Some(transport);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    pub(crate) fn close(&mut self) {
        if let Some(transport) = self.transport.take() {
            debug!(protocol = %self.protocol, peer = %transport.peer(), "closing connection");
        }
        self.state = ConnectionState::Unconnected;
        self.sasl_mechanisms.clear();
        self.synchronous = true;
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub(crate) fn set_synchronous(&mut self, enable: bool) {
        self.synchronous = enable;
    }

    pub(crate) fn is_asynchronous(&self) -> bool {
        !self.synchronous
    }

    pub(crate) fn set_sasl_mechanisms(&mut self, mechanisms: Vec<String>) {
        self.sasl_mechanisms = mechanisms;
    }

    pub(crate) fn next_opaque(&mut self) -> u32 {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        opaque
    }

    pub(crate) fn send(&mut self, data: &[u8]) -> ClientResult<()> {
        let transport = self.transport.as_mut().ok_or(ClientError::NotConnected)?;
        trace!(protocol = %self.protocol, len = data.len(), "send");
        transport.send(data)
    }

    pub(crate) fn read_into(&mut self, frame: &mut Frame, count: usize) -> ClientResult<()> {
        let transport = self.transport.as_mut().ok_or(ClientError::NotConnected)?;
        transport.read_into(frame, count)
    }

    pub(crate) fn require_connected(&self) -> ClientResult<()> {
        if self.transport.is_none() {
            return Err(ClientError::NotConnected);
        }
        Ok(())
    }

    /// High-level operations are round trips; pipelining is raw frames only.
    pub(crate) fn require_synchronous(&self) -> ClientResult<()> {
        self.require_connected()?;
        if !self.synchronous {
            return Err(ClientError::NotSupported(
                "high-level operations in asynchronous mode",
            ));
        }
        Ok(())
    }

    /// Rejects the operation with the protocol's access-denied code unless the
    /// session has authenticated.
    pub(crate) fn require_authenticated(&self, context: &str) -> ClientResult<()> {
        self.require_synchronous()?;
        if self.state < ConnectionState::Authenticated {
            let reason = match self.protocol {
                Protocol::Memcached => mcbp::Status::AccessDenied.as_u16(),
                Protocol::Greenstack => greenstack::Status::NoAccess.as_u16(),
            };
            return Err(ConnectionError::new(self.protocol, reason, context).into());
        }
        Ok(())
    }
}

impl fmt::Display for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(
                f,
                "{} {} [{}]:{}",
                self.protocol,
                self.transport_kind(),
                self.host,
                self.port
            )
        } else {
            write!(
                f,
                "{} {} {}:{}",
                self.protocol,
                self.transport_kind(),
                self.host,
                self.port
            )
        }
    }
}

impl fmt::Debug for ConnectionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCore")
            .field("target", &self.to_string())
            .field("state", &self.state)
            .field("synchronous", &self.synchronous)
            .finish()
    }
}

/// Expiration text to seconds; empty means no expiry.
pub(crate) fn parse_expiration(text: &str) -> ClientResult<u32> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    text.parse::<u32>()
        .map_err(|_| ClientError::InvalidArgument(format!("invalid expiration: {text:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unconnected(protocol: Protocol) -> Box<dyn MemcachedConnection> {
        new_connection(
            "127.0.0.1",
            11210,
            AddressFamily::Inet,
            false,
            protocol,
            ConnectionOptions::default(),
        )
    }

    #[test]
    fn starts_unconnected() {
        let conn = unconnected(Protocol::Memcached);
        assert_eq!(conn.state(), ConnectionState::Unconnected);
        assert!(conn.sasl_mechanisms().is_empty());
        assert!(conn.is_synchronous());
        assert!(!conn.is_ssl());
    }

    #[test]
    fn operations_before_connect_fail_generically() {
        let mut conn = unconnected(Protocol::Greenstack);
        let err = conn.get("key", 0).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
        assert!(err.connection_error().is_none());
    }

    #[test]
    fn partial_send_validates_length_first() {
        let mut conn = unconnected(Protocol::Memcached);
        let mut frame = Frame::from_slice(b"abc");
        let err = conn.send_partial_frame(&mut frame, 4).unwrap_err();
        assert!(err.is_invalid_arguments());
        assert_eq!(frame.len(), 3);
    }

    #[test]
    fn display_names_protocol_transport_and_address() {
        let conn = unconnected(Protocol::Memcached);
        assert_eq!(conn.to_string(), "Memcached Plain 127.0.0.1:11210");

        let conn = new_connection(
            "::1",
            11207,
            AddressFamily::Inet6,
            true,
            Protocol::Greenstack,
            ConnectionOptions::default(),
        );
        assert_eq!(conn.to_string(), "Greenstack SslIpv6 [::1]:11207");
    }

    #[test]
    fn tls_without_config_is_rejected() {
        let mut conn = new_connection(
            "127.0.0.1",
            1,
            AddressFamily::Inet,
            true,
            Protocol::Memcached,
            ConnectionOptions::default(),
        );
        assert!(matches!(conn.connect(), Err(ClientError::NotSupported(_))));
        assert_eq!(conn.state(), ConnectionState::Unconnected);
    }

    #[test]
    fn clone_keeps_target_only() {
        let conn = unconnected(Protocol::Greenstack);
        let copy = conn.clone_connection();
        assert_eq!(copy.protocol(), Protocol::Greenstack);
        assert_eq!(copy.port(), 11210);
        assert_eq!(copy.state(), ConnectionState::Unconnected);
    }

    #[test]
    fn expiration_parsing() {
        assert_eq!(parse_expiration("").unwrap(), 0);
        assert_eq!(parse_expiration("300").unwrap(), 300);
        assert!(parse_expiration("soon").unwrap_err().is_invalid_arguments());
    }
}
