use thiserror::Error;

use super::bitfield::BitfieldError;
use crate::storage::StorageError;

/// Errors that end a peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrong length byte or protocol string.
    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// The peer presented a different id than the one already known for it.
    #[error("peer id mismatch")]
    PeerIdMismatch,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// An id outside the message table, or a fast extension message when
    /// the extension was not negotiated.
    #[error("unknown message id: {0}")]
    UnknownMessage(u8),

    #[error("invalid bitfield: {0}")]
    Bitfield(#[from] BitfieldError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timeout")]
    Timeout,
}
