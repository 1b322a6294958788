//! Error types for the network backbone.
//!
//! Errors are split by the layer that produces them. None of them ever crosses
//! a message queue: connection-level failures are turned into lifecycle
//! messages, and handler failures are reported as a `false` return from a
//! manager.

use thiserror::Error;

/// Failures raised by the packet codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// A read asked for more bytes than remain unread.
    #[error("packet underflow: needed {needed} byte(s), {left} left")]
    Underflow { needed: usize, left: usize },

    /// A write would grow the packet past its capacity.
    #[error("packet overflow: writing {needed} byte(s) at offset {offset} exceeds capacity {capacity}")]
    Overflow {
        needed: usize,
        offset: usize,
        capacity: usize,
    },

    /// A seek targeted a position outside the written bytes.
    #[error("seek to {position} is outside the packet (size {size})")]
    Seek { position: usize, size: usize },

    /// A string could not be represented in the requested encoding.
    #[error("string is not representable in {0}")]
    Encoding(&'static str),

    /// A string is longer than its length prefix can describe.
    #[error("string of {0} byte(s) does not fit a 16-bit length prefix")]
    StringTooLong(usize),
}

/// Wire-level violations. Every variant is fatal to the connection that
/// produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed handshake: {0}")]
    Handshake(String),

    #[error("unexpected handshake control code 0x{actual:04X} (expected 0x{expected:04X})")]
    UnexpectedControl { expected: u16, actual: u16 },

    #[error("invalid Diffie-Hellman value: {0}")]
    InvalidKey(String),

    #[error("key check block mismatch")]
    CipherMismatch,

    #[error("transmission unit of {0} byte(s) is not a whole number of cipher blocks")]
    BadPadding(usize),

    #[error("transmission unit length {length} outside 1..={max}")]
    UnitSize { length: usize, max: usize },

    #[error("truncated data: declared {declared} byte(s), {available} available")]
    Truncated { declared: usize, available: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("handshake did not complete in time")]
    HandshakeTimeout,
}

impl From<PacketError> for ProtocolError {
    fn from(err: PacketError) -> Self {
        ProtocolError::MalformedPacket(err.to_string())
    }
}

/// Returned by [`crate::MessageQueue::enqueue`] once the queue has been shut down.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("message queue is shut down")]
pub struct QueueClosed;

/// Failures of the outbound operations on a [`crate::Connection`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection is not encrypted yet")]
    NotEncrypted,

    #[error("connection is closed")]
    Closed,

    #[error("packet of {0} byte(s) does not fit a logical packet frame")]
    PacketTooLarge(usize),

    #[error("packet is missing its packet code")]
    MissingCode,
}

/// Errors surfaced by the server and its configuration.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Network-related error (bind, listen, connect)
    #[error("Network error: {0}")]
    Network(String),

    /// Internal server error (runtime creation, thread spawn, invalid state)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Rejected configuration
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
