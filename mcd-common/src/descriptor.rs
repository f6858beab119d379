//! # Server Port Descriptor
//!
//! The server writes the ports it listens on to a JSON file:
//!
//! ```json
//! {"ports":[{"port":11210,"protocol":"memcached","ssl":false,"family":"AF_INET"}]}
//! ```
//!
//! Connection maps are built from this list.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AddressFamily, Protocol};

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("failed to read port file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid port descriptor: {0}")]
    Json(#[from] serde_json::Error),
}

/// One listening port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortEntry {
    pub port: u16,
    pub protocol: Protocol,
    pub ssl: bool,
    pub family: AddressFamily,
    /// Overrides the family's loopback address when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl PortEntry {
    pub fn new(port: u16, protocol: Protocol, ssl: bool, family: AddressFamily) -> Self {
        PortEntry {
            port,
            protocol,
            ssl,
            family,
            host: None,
        }
    }

    /// Host to connect to for this entry.
    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or_else(|| self.family.loopback())
    }
}

/// All ports announced by a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub ports: Vec<PortEntry>,
}

impl PortDescriptor {
    pub fn from_json_str(text: &str) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self, DescriptorError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Reads the port file written by the server.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DescriptorError> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_string(&self) -> Result<String, DescriptorError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "ports": [
            {"port": 11210, "protocol": "memcached", "ssl": false, "family": "AF_INET"},
            {"port": 11207, "protocol": "memcached", "ssl": true, "family": "AF_INET"},
            {"port": 11211, "protocol": "greenstack", "ssl": false, "family": "AF_INET6"}
        ]
    }"#;

    #[test]
    fn parses_port_file() {
        let desc = PortDescriptor::from_json_str(SAMPLE).unwrap();
        assert_eq!(desc.ports.len(), 3);
        assert_eq!(
            desc.ports[1],
            PortEntry::new(11207, Protocol::Memcached, true, AddressFamily::Inet)
        );
        assert_eq!(desc.ports[2].protocol, Protocol::Greenstack);
        assert_eq!(desc.ports[2].host(), "::1");
        assert_eq!(desc.ports[0].host(), "127.0.0.1");
    }

    #[test]
    fn explicit_host_wins() {
        let desc = PortDescriptor::from_value(serde_json::json!({
            "ports": [{"port": 1, "protocol": "memcached", "ssl": false,
                       "family": "AF_INET", "host": "localhost"}]
        }))
        .unwrap();
        assert_eq!(desc.ports[0].host(), "localhost");
    }

    #[test]
    fn rejects_unknown_protocol() {
        let err = PortDescriptor::from_json_str(
            r#"{"ports":[{"port":1,"protocol":"http","ssl":false,"family":"AF_INET"}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, DescriptorError::Json(_)));
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("mcd-ports-{}.json", std::process::id()));
        fs::write(&path, SAMPLE).unwrap();
        let desc = PortDescriptor::load(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(desc.ports.len(), 3);

        assert!(matches!(
            PortDescriptor::load(&path),
            Err(DescriptorError::Io(_))
        ));
    }
}
