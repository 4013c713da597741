use thiserror::Error;

use crate::bencode::BencodeError;

/// Errors that can occur when parsing a torrent file.
#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] BencodeError),

    /// A required field is missing from the torrent file.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A field has an invalid value or type.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("invalid info hash length")]
    InvalidInfoHashLength,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
