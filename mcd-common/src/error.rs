//! # Error Classification
//!
//! Purpose: Describe server rejections independently of the wire protocol and
//! report codec failures while parsing frames.
//!
//! ## Design Principles
//! 1. **Raw Code Preserved**: A `ConnectionError` keeps the server's reason
//!    code and protocol tag; interpretation happens on demand.
//! 2. **Predicates over Codes**: Callers branch on `is_not_found()` and
//!    friends, never on numeric codes.
//! 3. **Per-Protocol Tables**: Each protocol maps its status codes to an
//!    `ErrorClass` in its own module.

use std::fmt;

use crate::types::Protocol;
use crate::{greenstack, mcbp};

/// Protocol-independent category of a server rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    InvalidArguments,
    AlreadyExists,
    NotMyVbucket,
    NotFound,
    NotStored,
    AccessDenied,
}

/// The server answered, but rejected the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    protocol: Protocol,
    reason: u16,
    context: String,
}

impl ConnectionError {
    /// Creates an error for `reason` as reported by `protocol`.
    pub fn new(protocol: Protocol, reason: u16, context: impl Into<String>) -> Self {
        ConnectionError {
            protocol,
            reason,
            context: context.into(),
        }
    }

    /// Raw reason code; its meaning depends on `protocol()`.
    pub fn reason(&self) -> u16 {
        self.reason
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Short description of the operation that failed.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Category of the reason code under the protocol's rules.
    pub fn class(&self) -> Option<ErrorClass> {
        match self.protocol {
            Protocol::Memcached => mcbp::Status::from_u16(self.reason).and_then(|s| s.class()),
            Protocol::Greenstack => {
                greenstack::Status::from_u16(self.reason).and_then(|s| s.class())
            }
        }
    }

    pub fn is_invalid_arguments(&self) -> bool {
        self.class() == Some(ErrorClass::InvalidArguments)
    }

    pub fn is_already_exists(&self) -> bool {
        self.class() == Some(ErrorClass::AlreadyExists)
    }

    pub fn is_not_my_vbucket(&self) -> bool {
        self.class() == Some(ErrorClass::NotMyVbucket)
    }

    pub fn is_not_found(&self) -> bool {
        self.class() == Some(ErrorClass::NotFound)
    }

    pub fn is_not_stored(&self) -> bool {
        self.class() == Some(ErrorClass::NotStored)
    }

    pub fn is_access_denied(&self) -> bool {
        self.class() == Some(ErrorClass::AccessDenied)
    }

    fn reason_text(&self) -> &'static str {
        match self.protocol {
            Protocol::Memcached => mcbp::Status::from_u16(self.reason)
                .map(|s| s.as_str())
                .unwrap_or("Unknown status"),
            Protocol::Greenstack => greenstack::Status::from_u16(self.reason)
                .map(|s| s.as_str())
                .unwrap_or("Unknown status"),
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} failed: {} ({:#06x})",
            self.protocol,
            self.context,
            self.reason_text(),
            self.reason
        )
    }
}

impl std::error::Error for ConnectionError {}

/// Failure while encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Need more bytes to complete the unit.
    #[error("incomplete frame")]
    Incomplete,

    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    /// Lengths in the header disagree with the body.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("key too long: {0} bytes")]
    KeyTooLong(usize),

    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Returns true if this error indicates more data is needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CodecError::Incomplete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_protocol_predicates() {
        let err = ConnectionError::new(Protocol::Memcached, 0x01, "get");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());

        assert!(ConnectionError::new(Protocol::Memcached, 0x02, "add").is_already_exists());
        assert!(ConnectionError::new(Protocol::Memcached, 0x04, "x").is_invalid_arguments());
        assert!(ConnectionError::new(Protocol::Memcached, 0x05, "x").is_not_stored());
        assert!(ConnectionError::new(Protocol::Memcached, 0x07, "x").is_not_my_vbucket());
        assert!(ConnectionError::new(Protocol::Memcached, 0x24, "x").is_access_denied());
        assert!(ConnectionError::new(Protocol::Memcached, 0x20, "x").is_access_denied());
    }

    #[test]
    fn greenstack_predicates() {
        let err = ConnectionError::new(Protocol::Greenstack, 0x0012, "get");
        assert!(err.is_not_my_vbucket());
        assert!(ConnectionError::new(Protocol::Greenstack, 0x0008, "x").is_not_found());
        assert!(ConnectionError::new(Protocol::Greenstack, 0x000d, "x").is_already_exists());
        assert!(ConnectionError::new(Protocol::Greenstack, 0x0007, "x").is_access_denied());
        assert!(ConnectionError::new(Protocol::Greenstack, 0x0013, "x").is_not_stored());
        assert!(ConnectionError::new(Protocol::Greenstack, 0x0001, "x").is_invalid_arguments());
    }

    #[test]
    fn same_code_means_different_things_per_protocol() {
        // 0x0007 is "not my vbucket" in the binary protocol, "no access" in Greenstack.
        let binary = ConnectionError::new(Protocol::Memcached, 0x07, "x");
        let green = ConnectionError::new(Protocol::Greenstack, 0x07, "x");
        assert!(binary.is_not_my_vbucket());
        assert!(!binary.is_access_denied());
        assert!(green.is_access_denied());
        assert!(!green.is_not_my_vbucket());
    }

    #[test]
    fn unknown_code_has_no_class() {
        let err = ConnectionError::new(Protocol::Memcached, 0x7777, "x");
        assert_eq!(err.class(), None);
        assert!(err.to_string().contains("Unknown status"));
    }

    #[test]
    fn display_includes_context_and_code() {
        let err = ConnectionError::new(Protocol::Memcached, 0x01, "get");
        assert_eq!(err.to_string(), "Memcached get failed: Key not found (0x0001)");
    }
}
