//! Piece storage on disk.
//!
//! A torrent's data is the concatenation of its files, split into
//! fixed-length pieces. [`StorageLayout`] maps piece offsets onto files,
//! [`PieceStorage`] reads, writes and verifies pieces, and [`PieceProgress`]
//! tracks which blocks of each piece have been received.
//!
//! # Example
//!
//! ```no_run
//! use swarmbit::storage::{FileEntry, PieceStorage, StorageLayout};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let layout = StorageLayout::new(
//!     vec![
//!         FileEntry::new("album/a.flac", 1000),
//!         FileEntry::new("album/b.flac", 500),
//!     ],
//!     512,
//!     vec![[0u8; 20]; 3],
//! )?;
//!
//! let storage = PieceStorage::open("./downloads", layout, true).await;
//! storage.write(2, 0, &[0u8; 476]).await?;
//! let valid = storage.verify(2).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! File paths containing `..`, a root or a drive prefix are rejected when
//! the layout is built.

mod disk;
mod error;
mod layout;
mod progress;

pub use disk::PieceStorage;
pub use error::StorageError;
pub use layout::{FileEntry, FileSpan, StorageLayout};
pub use progress::{BlockMark, PieceProgress};

#[cfg(test)]
mod tests;
