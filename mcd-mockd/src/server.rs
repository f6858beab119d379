//! # Mock Server
//!
//! Purpose: Run an in-process memcached node on ephemeral loopback ports so
//! client tests have something real to talk to.
//!
//! ## Design Principles
//! 1. **Own Runtime**: The server drives its own multi-thread tokio runtime,
//!    so blocking clients can run on the test thread.
//! 2. **One Listener Per Port**: Each (protocol, TLS) pair gets its own port,
//!    announced through a `PortDescriptor` like a real node's port file.
//! 3. **Shared State**: Every listener serves the same `ServerState`.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mcd_common::{AddressFamily, PortDescriptor, PortEntry, Protocol};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::error::MockError;
use crate::store::ServerState;
use crate::{greenstack, mcbp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Listener {
    protocol: Protocol,
    ssl: bool,
}

/// Which ports the mock opens.
#[derive(Debug, Clone)]
pub struct MockConfig {
    listeners: Vec<Listener>,
    tls: Option<Arc<ServerConfig>>,
}

impl Default for MockConfig {
    /// Plain binary protocol and plain Greenstack.
    fn default() -> Self {
        MockConfig {
            listeners: vec![
                Listener {
                    protocol: Protocol::Memcached,
                    ssl: false,
                },
                Listener {
                    protocol: Protocol::Greenstack,
                    ssl: false,
                },
            ],
            tls: None,
        }
    }
}

impl MockConfig {
    /// Adds TLS listeners for both protocols using `config`.
    pub fn with_tls(mut self, config: Arc<ServerConfig>) -> Self {
        for protocol in [Protocol::Memcached, Protocol::Greenstack] {
            let listener = Listener {
                protocol,
                ssl: true,
            };
            if !self.listeners.contains(&listener) {
                self.listeners.push(listener);
            }
        }
        self.tls = Some(config);
        self
    }
}

/// Builds a TLS server configuration from a DER certificate chain and key.
pub fn server_config_from_der(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, MockError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(Arc::new(config))
}

/// A running mock node; stops when dropped.
pub struct MockServer {
    runtime: Option<Runtime>,
    state: Arc<ServerState>,
    descriptor: PortDescriptor,
}

impl MockServer {
    /// Binds every configured listener on 127.0.0.1 and starts serving.
    pub fn start(config: MockConfig) -> Result<Self, MockError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("mcd-mockd")
            .enable_all()
            .build()?;
        let state = Arc::new(ServerState::new());
        let acceptor = config.tls.map(TlsAcceptor::from);

        let mut ports = Vec::with_capacity(config.listeners.len());
        for listener in config.listeners {
            let tls = if listener.ssl {
                Some(acceptor.clone().ok_or(MockError::MissingTlsConfig)?)
            } else {
                None
            };
            let socket = runtime.block_on(TcpListener::bind(("127.0.0.1", 0)))?;
            let port = socket.local_addr()?.port();
            info!(protocol = %listener.protocol, ssl = listener.ssl, port, "listening");
            runtime.spawn(accept_loop(socket, listener.protocol, tls, Arc::clone(&state)));
            ports.push(PortEntry::new(
                port,
                listener.protocol,
                listener.ssl,
                AddressFamily::Inet,
            ));
        }

        Ok(MockServer {
            runtime: Some(runtime),
            state,
            descriptor: PortDescriptor { ports },
        })
    }

    /// The ports this server announces.
    pub fn descriptor(&self) -> &PortDescriptor {
        &self.descriptor
    }

    pub fn port(&self, protocol: Protocol, ssl: bool) -> Option<u16> {
        self.descriptor
            .ports
            .iter()
            .find(|entry| entry.protocol == protocol && entry.ssl == ssl)
            .map(|entry| entry.port)
    }

    /// Writes the port descriptor as JSON, like a server's port file.
    pub fn write_port_file(&self, path: impl AsRef<Path>) -> Result<(), MockError> {
        std::fs::write(path, self.descriptor.to_json_string()?)?;
        Ok(())
    }

    /// Number of audit configuration reloads served so far.
    pub fn audit_reloads(&self) -> u64 {
        self.state.audit_reloads()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    protocol: Protocol,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        if let Err(err) = socket.set_nodelay(true) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }
        state.connection_opened();
        tokio::spawn(serve(socket, peer, protocol, tls.clone(), Arc::clone(&state)));
    }
}

async fn serve(
    socket: TcpStream,
    peer: SocketAddr,
    protocol: Protocol,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
) {
    debug!(%peer, %protocol, tls = tls.is_some(), "connection accepted");
    let result = match tls {
        Some(acceptor) => match acceptor.accept(socket).await {
            Ok(stream) => handle(stream, protocol, state).await,
            Err(err) => Err(err),
        },
        None => handle(socket, protocol, state).await,
    };
    match result {
        Ok(()) => debug!(%peer, "connection closed"),
        Err(err) => debug!(%peer, error = %err, "connection closed with error"),
    }
}

async fn handle<S>(stream: S, protocol: Protocol, state: Arc<ServerState>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match protocol {
        Protocol::Memcached => mcbp::handle_connection(stream, state).await,
        Protocol::Greenstack => greenstack::handle_connection(stream, state).await,
    }
}
