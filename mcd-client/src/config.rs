//! # Connection Options
//!
//! Purpose: Carry the socket timeouts, nodelay flag and TLS client config
//! every connection (and every connection a map builds) is created with.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Socket and TLS settings shared by every connection created from them.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Disable Nagle on the socket.
    pub nodelay: bool,
    /// Client TLS configuration; required to connect to TLS ports.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            nodelay: true,
            tls: None,
        }
    }
}

impl ConnectionOptions {
    /// Applies the same timeout to connect, read and write.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self.read_timeout = Some(timeout);
        self.write_timeout = Some(timeout);
        self
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("nodelay", &self.nodelay)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}
