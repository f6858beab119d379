//! Client error type.
//!
//! `Connection` is the only variant produced by a server rejection; all other
//! variants are generic failures that leave the connection unusable until
//! `reconnect()`.

use mcd_common::{CodecError, ConnectionError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected the operation.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    /// Framing violation on the wire.
    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No connection in the map matches the request.
    #[error("no connection for {0}")]
    Lookup(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// The server rejection, if this error is one.
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        match self {
            ClientError::Connection(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_invalid_arguments(&self) -> bool {
        match self {
            ClientError::InvalidArgument(_) => true,
            ClientError::Connection(err) => err.is_invalid_arguments(),
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.connection_error()
            .is_some_and(ConnectionError::is_already_exists)
    }

    pub fn is_not_my_vbucket(&self) -> bool {
        self.connection_error()
            .is_some_and(ConnectionError::is_not_my_vbucket)
    }

    pub fn is_not_found(&self) -> bool {
        self.connection_error()
            .is_some_and(ConnectionError::is_not_found)
    }

    pub fn is_not_stored(&self) -> bool {
        self.connection_error()
            .is_some_and(ConnectionError::is_not_stored)
    }

    pub fn is_access_denied(&self) -> bool {
        self.connection_error()
            .is_some_and(ConnectionError::is_access_denied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcd_common::Protocol;

    #[test]
    fn forwards_predicates_from_server_rejections() {
        let err: ClientError = ConnectionError::new(Protocol::Memcached, 0x02, "add").into();
        assert!(err.is_already_exists());
        assert!(!err.is_not_found());
        assert_eq!(err.connection_error().map(|e| e.reason()), Some(0x02));
    }

    #[test]
    fn generic_failures_are_unclassified() {
        let err = ClientError::NotConnected;
        assert!(err.connection_error().is_none());
        assert!(!err.is_access_denied());
        assert!(!err.is_not_found());
    }

    #[test]
    fn invalid_argument_is_classified() {
        let err = ClientError::InvalidArgument("ioctl".into());
        assert!(err.is_invalid_arguments());
        assert!(err.connection_error().is_none());
    }

    #[test]
    fn display_is_transparent_for_rejections() {
        let err: ClientError = ConnectionError::new(Protocol::Greenstack, 0x0008, "get").into();
        assert_eq!(err.to_string(), "Greenstack get failed: Not found (0x0008)");
    }
}
