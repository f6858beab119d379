//! # Frame Container
//!
//! Purpose: Hold exactly one protocol unit (request or response) as raw bytes,
//! independent of which wire protocol produced it.
//!
//! ## Design Principles
//! 1. **Owned Buffer**: A frame owns its bytes; nothing else aliases them.
//! 2. **Consume-Front**: Partial I/O removes the transferred prefix in place so
//!    the remainder can be resumed later.
//! 3. **Buffer Reuse**: `reset` keeps the allocation for the next unit.

use bytes::{Buf, BytesMut};

/// One complete protocol unit on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Raw bytes of the unit (header and body).
    pub payload: BytesMut,
}

impl Frame {
    /// Creates an empty frame.
    pub fn new() -> Self {
        Frame {
            payload: BytesMut::new(),
        }
    }

    /// Creates an empty frame with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Frame {
            payload: BytesMut::with_capacity(capacity),
        }
    }

    /// Creates a frame holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Frame {
            payload: BytesMut::from(data),
        }
    }

    /// Empties the frame in place.
    pub fn reset(&mut self) {
        self.payload.clear();
    }

    /// Number of bytes currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Returns true when the frame holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Borrow the bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.payload
    }

    /// Appends bytes to the end of the frame.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.payload.extend_from_slice(data);
    }

    /// Removes the first `count` bytes, keeping only the trailing remainder.
    ///
    /// `count` is clamped to the frame length.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.payload.len());
        self.payload.advance(count);
    }
}

impl From<Vec<u8>> for Frame {
    fn from(data: Vec<u8>) -> Self {
        Frame {
            payload: BytesMut::from(&data[..]),
        }
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}
