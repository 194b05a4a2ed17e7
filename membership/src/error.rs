//! Error types for the membership layer.

use {crate::identity::Identity, std::io, thiserror::Error};

/// Errors that can occur in the membership layer.
#[derive(Error, Debug)]
pub enum MembershipError {
    /// Socket-level I/O error.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize or deserialize a message body.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A frame or datagram did not start with the expected magic number.
    #[error("bad magic number: expected {expected}, found {found}")]
    BadMagic {
        /// The magic number this endpoint accepts.
        expected: i32,
        /// The magic number found on the wire.
        found: i32,
    },

    /// A frame arrived with a sequence number other than the next one.
    #[error("out of order frame: expected sequence {expected}, found {found}")]
    OutOfOrder {
        /// The sequence number the reader was waiting for.
        expected: i64,
        /// The sequence number found in the header.
        found: i64,
    },

    /// A frame header announced a negative or oversized payload.
    #[error("invalid frame length {length} (max {max})")]
    InvalidFrameLength {
        /// Length announced by the header.
        length: i64,
        /// Configured maximum.
        max: usize,
    },

    /// The first message on an accepted socket was not a heartbeat, or the
    /// heartbeat named a peer we know nothing about.
    #[error("handshake violation: {0}")]
    Handshake(String),

    /// The peer is not known to the connection set.
    #[error("unknown peer: {0}")]
    UnknownPeer(Identity),

    /// A node id exceeds [`crate::identity::MAX_ID`].
    #[error("node id {0} out of range")]
    InvalidNodeId(u32),

    /// A gossip datagram or one of its records could not be parsed.
    #[error("malformed gossip: {0}")]
    MalformedGossip(String),

    /// The connection is closed; nothing more can be sent on it.
    #[error("connection closed")]
    ConnectionClosed,

    /// The reactor has been shut down.
    #[error("reactor is shut down")]
    ReactorShutdown,
}

impl MembershipError {
    /// Transient disconnects are ordinary closes and are not logged as errors.
    pub fn is_benign_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => is_benign_io_error(e),
            Self::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Protocol violations destroy the connection and are never retried
    /// locally.
    pub fn is_protocol_fatal(&self) -> bool {
        matches!(
            self,
            Self::BadMagic { .. }
                | Self::OutOfOrder { .. }
                | Self::InvalidFrameLength { .. }
                | Self::Handshake(_)
                | Self::Serialization(_)
        )
    }
}

/// EOF, broken pipe and connection reset all mean the peer went away.
pub fn is_benign_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Convenience result type for membership operations.
pub type Result<T> = std::result::Result<T, MembershipError>;
