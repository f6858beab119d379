//! # Connection Map
//!
//! Purpose: Hold one pre-built connection per port a server announces and
//! hand them out by (protocol, TLS, family, port).
//!
//! ## Design Principles
//! 1. **Registry, Not Pool**: The map owns its connections; callers borrow
//!    them and the borrow cannot outlive the map.
//! 2. **Lazy Connect**: Connections are created unconnected; the caller
//!    decides when to `connect`.
//! 3. **Caller Serializes**: `initialize`/`invalidate` take `&mut self`, so
//!    they cannot race lookups.

use mcd_common::{AddressFamily, PortDescriptor, Protocol};
use tracing::debug;

use crate::config::ConnectionOptions;
use crate::connection::{new_connection, MemcachedConnection};
use crate::error::{ClientError, ClientResult};

/// Connections to every announced port of one server.
pub struct ConnectionMap {
    options: ConnectionOptions,
    connections: Vec<Box<dyn MemcachedConnection>>,
}

impl Default for ConnectionMap {
    fn default() -> Self {
        ConnectionMap::new(ConnectionOptions::default())
    }
}

impl ConnectionMap {
    /// Creates an empty map; connections it creates use `options`.
    pub fn new(options: ConnectionOptions) -> Self {
        ConnectionMap {
            options,
            connections: Vec::new(),
        }
    }

    /// Replaces the contents with one unconnected connection per distinct
    /// (protocol, TLS, family, port) entry of `descriptor`.
    pub fn initialize(&mut self, descriptor: &PortDescriptor) {
        self.invalidate();
        for entry in &descriptor.ports {
            let duplicate = self.connections.iter().any(|conn| {
                conn.protocol() == entry.protocol
                    && conn.is_ssl() == entry.ssl
                    && conn.family() == entry.family
                    && conn.port() == entry.port
            });
            if duplicate {
                continue;
            }
            self.connections.push(new_connection(
                entry.host(),
                entry.port,
                entry.family,
                entry.ssl,
                entry.protocol,
                self.options.clone(),
            ));
        }
        debug!(connections = self.connections.len(), "connection map initialized");
    }

    /// Closes and discards every connection.
    pub fn invalidate(&mut self) {
        for conn in &mut self.connections {
            conn.close();
        }
        if !self.connections.is_empty() {
            debug!(connections = self.connections.len(), "connection map invalidated");
        }
        self.connections.clear();
    }

    /// Finds a connection; `port == 0` matches any port.
    pub fn get_connection(
        &mut self,
        protocol: Protocol,
        ssl: bool,
        family: AddressFamily,
        port: u16,
    ) -> ClientResult<&mut dyn MemcachedConnection> {
        for conn in self.connections.iter_mut() {
            if matches(conn.as_ref(), protocol, ssl, family, port) {
                let conn: &mut dyn MemcachedConnection = conn.as_mut();
                return Ok(conn);
            }
        }
        Err(ClientError::Lookup(describe(protocol, ssl, family, port)))
    }

    /// Whether any connection matches, on any port.
    pub fn contains(&self, protocol: Protocol, ssl: bool, family: AddressFamily) -> bool {
        self.connections
            .iter()
            .any(|conn| matches(conn.as_ref(), protocol, ssl, family, 0))
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn MemcachedConnection> {
        self.connections.iter().map(|conn| conn.as_ref() as &dyn MemcachedConnection)
    }
}

impl Drop for ConnectionMap {
    fn drop(&mut self) {
        self.invalidate();
    }
}

fn matches(
    conn: &dyn MemcachedConnection,
    protocol: Protocol,
    ssl: bool,
    family: AddressFamily,
    port: u16,
) -> bool {
    conn.protocol() == protocol
        && conn.is_ssl() == ssl
        && conn.family() == family
        && (port == 0 || conn.port() == port)
}

fn describe(protocol: Protocol, ssl: bool, family: AddressFamily, port: u16) -> String {
    let tls = if ssl { "ssl" } else { "plain" };
    if port == 0 {
        format!("{protocol} {tls} {family}")
    } else {
        format!("{protocol} {tls} {family} port {port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcd_common::PortEntry;

    fn descriptor() -> PortDescriptor {
        PortDescriptor {
            ports: vec![
                PortEntry::new(11210, Protocol::Memcached, false, AddressFamily::Inet),
                PortEntry::new(11207, Protocol::Memcached, true, AddressFamily::Inet),
                PortEntry::new(11211, Protocol::Greenstack, false, AddressFamily::Inet),
                PortEntry::new(11212, Protocol::Greenstack, false, AddressFamily::Inet),
                PortEntry::new(11210, Protocol::Memcached, false, AddressFamily::Inet),
            ],
        }
    }

    #[test]
    fn initialize_dedupes_entries() {
        let mut map = ConnectionMap::default();
        map.initialize(&descriptor());
        assert_eq!(map.len(), 4);
        assert!(map.iter().all(|conn| conn.state() == crate::ConnectionState::Unconnected));
    }

    #[test]
    fn lookup_by_tls_flag() {
        let mut map = ConnectionMap::default();
        map.initialize(&descriptor());

        let conn = map
            .get_connection(Protocol::Memcached, true, AddressFamily::Inet, 0)
            .unwrap();
        assert!(conn.is_ssl());
        assert_eq!(conn.protocol(), Protocol::Memcached);
        assert_eq!(conn.port(), 11207);

        let err = map
            .get_connection(Protocol::Greenstack, true, AddressFamily::Inet, 0)
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Lookup(_)));
        assert!(err.connection_error().is_none());
    }

    #[test]
    fn explicit_port_selects_one_entry() {
        let mut map = ConnectionMap::default();
        map.initialize(&descriptor());
        let conn = map
            .get_connection(Protocol::Greenstack, false, AddressFamily::Inet, 11212)
            .unwrap();
        assert_eq!(conn.port(), 11212);
        assert!(map
            .get_connection(Protocol::Greenstack, false, AddressFamily::Inet, 11210)
            .is_err());
    }

    #[test]
    fn contains_and_invalidate() {
        let mut map = ConnectionMap::default();
        map.initialize(&descriptor());
        assert!(map.contains(Protocol::Greenstack, false, AddressFamily::Inet));
        assert!(!map.contains(Protocol::Greenstack, false, AddressFamily::Inet6));

        map.invalidate();
        assert!(map.is_empty());
        assert!(!map.contains(Protocol::Memcached, false, AddressFamily::Inet));
        assert!(map
            .get_connection(Protocol::Memcached, false, AddressFamily::Inet, 0)
            .is_err());
    }
}
