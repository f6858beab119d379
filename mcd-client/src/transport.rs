//! # Socket Transport
//!
//! Purpose: Move raw bytes between a `Frame` and the server, over a plain TCP
//! socket or a rustls session layered on one.
//!
//! ## Design Principles
//! 1. **Interchangeable Streams**: Both variants implement `Read`/`Write`, so
//!    the framing code never branches on TLS.
//! 2. **Scoped Session**: The TLS session lives inside the transport; dropping
//!    the transport sends close_notify and shuts the socket down.
//! 3. **Exact Reads**: Short reads loop until satisfied; EOF is an I/O error.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use mcd_common::{AddressFamily, Frame};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use tracing::{trace, warn};

use crate::config::ConnectionOptions;
use crate::error::{ClientError, ClientResult};

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn socket(&self) -> &TcpStream {
        match self {
            Stream::Plain(sock) => sock,
            Stream::Tls(tls) => &tls.sock,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(sock) => sock.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(sock) => sock.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

/// An established byte stream to one server port.
pub(crate) struct Transport {
    stream: Stream,
    peer: SocketAddr,
}

impl Transport {
    /// Resolves `host`, connects over the requested family and performs the
    /// TLS handshake when `ssl` is set.
    pub(crate) fn connect(
        host: &str,
        port: u16,
        family: AddressFamily,
        ssl: bool,
        options: &ConnectionOptions,
    ) -> ClientResult<Self> {
        // Check before touching the network.
        let tls_config = match (ssl, &options.tls) {
            (true, None) => return Err(ClientError::NotSupported("TLS without a client config")),
            (true, Some(config)) => Some(config.clone()),
            (false, _) => None,
        };

        let sock = connect_socket(host, port, family, options)?;
        let peer = sock.peer_addr()?;

        let stream = match tls_config {
            None => Stream::Plain(sock),
            Some(config) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| ClientError::InvalidArgument(format!("{host}: {e}")))?;
                let conn = ClientConnection::new(config, name)?;
                let mut tls = StreamOwned::new(conn, sock);
                while tls.conn.is_handshaking() {
                    tls.conn.complete_io(&mut tls.sock)?;
                }
                trace!(peer = %peer, "tls handshake complete");
                Stream::Tls(Box::new(tls))
            }
        };

        Ok(Transport { stream, peer })
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Writes all of `data`.
    pub(crate) fn send(&mut self, data: &[u8]) -> ClientResult<()> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Appends exactly `count` bytes read from the peer to `frame`.
    pub(crate) fn read_into(&mut self, frame: &mut Frame, count: usize) -> ClientResult<()> {
        let start = frame.len();
        frame.payload.resize(start + count, 0);
        if let Err(err) = self.stream.read_exact(&mut frame.payload[start..]) {
            frame.payload.truncate(start);
            return Err(err.into());
        }
        Ok(())
    }

    /// Sends close_notify (TLS) and shuts the socket down. Runs once, on drop.
    fn shutdown(&mut self) {
        if let Stream::Tls(tls) = &mut self.stream {
            tls.conn.send_close_notify();
            if let Err(err) = tls.conn.complete_io(&mut tls.sock) {
                warn!(peer = %self.peer, error = %err, "tls close_notify failed");
            }
        }
        let _ = self.stream.socket().shutdown(Shutdown::Both);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connect_socket(
    host: &str,
    port: u16,
    family: AddressFamily,
    options: &ConnectionOptions,
) -> ClientResult<TcpStream> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()?
        .filter(|addr| family.matches(addr))
        .collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host}:{port} has no {family} address"),
        )
        .into());
    }

    let mut last_err = None;
    for addr in addrs {
        let attempt = match options.connect_timeout {
            Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
            None => TcpStream::connect(addr),
        };
        match attempt {
            Ok(stream) => {
                stream.set_read_timeout(options.read_timeout)?;
                stream.set_write_timeout(options.write_timeout)?;
                stream.set_nodelay(options.nodelay)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no address"))
        .into())
}
