use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The backing file does not exist and the storage is not allowed to
    /// create it.
    #[error("file missing: {}", .0.display())]
    FileMissing(PathBuf),

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    /// The byte range runs past the end of its piece.
    #[error("invalid block: piece {piece}, begin {begin}, length {length}")]
    InvalidBlock { piece: u32, begin: u32, length: u32 },

    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}

impl StorageError {
    /// True when the error only means the data is not on disk yet.
    pub fn is_missing_data(&self) -> bool {
        match self {
            StorageError::FileMissing(_) => true,
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}
