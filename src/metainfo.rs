//! Torrent metainfo ([BEP-3]).
//!
//! A torrent file describes the data being shared: file names and sizes,
//! the piece length and the SHA-1 of every piece, and the trackers to
//! announce to. [`Metainfo`] is the parsed form; it never changes after
//! loading.
//!
//! The [`InfoHash`] is computed over the `info` dictionary exactly as it
//! appears in the file, so torrents written by encoders that do not sort
//! their keys still hash to the value the rest of the swarm uses.
//!
//! # Example
//!
//! ```no_run
//! use swarmbit::metainfo::Metainfo;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data = std::fs::read("example.torrent")?;
//! let torrent = Metainfo::from_bytes(&data)?;
//!
//! println!("Name: {}", torrent.info.name);
//! println!("Info hash: {}", torrent.info_hash);
//! println!("Pieces: {}", torrent.info.piece_count());
//!
//! for file in &torrent.info.files {
//!     println!("  {} ({} bytes)", file.path.display(), file.length);
//! }
//! for tier in torrent.announce_tiers() {
//!     println!("Tier: {:?}", tier);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod error;
mod info_hash;
mod torrent;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use torrent::{File, Info, Metainfo};
