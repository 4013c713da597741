//! swarmbit - A BitTorrent client core
//!
//! This library downloads and seeds a single torrent: it announces to the
//! torrent's trackers, speaks the peer wire protocol with the peers they
//! return and keeps verified pieces on disk.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 Bencode encoding/decoding
//! - [`metainfo`] - BEP-3 torrent files and info hashes
//! - [`tracker`] - BEP-3/15/48 HTTP and UDP trackers, tier ranking and scheduling
//! - [`peer`] - BEP-3/6 peer wire protocol, request pipelining, choking
//! - [`storage`] - Piece layout over files, disk I/O and verification
//! - [`rate`] - Sliding-window transfer rates
//! - [`session`] - A running torrent tying the above together
//! - [`config`] - Tunables and their defaults

pub mod bencode;
pub mod config;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod rate;
pub mod session;
pub mod storage;
pub mod tracker;

pub use bencode::{decode, encode, BencodeError, Value};
pub use config::{ConfigError, PeerConfig, SessionConfig, TrackerConfig};
pub use metainfo::{File, Info, InfoHash, Metainfo, MetainfoError};
pub use peer::{
    Bitfield, BlockRequest, ChokePolicy, Handshake, Message, PeerConnection, PeerError, PeerId,
    PeerManager, RequestPipeline, SwarmEvents,
};
pub use rate::RateWindow;
pub use session::{Session, SessionError, TransferTotals};
pub use storage::{FileEntry, PieceProgress, PieceStorage, StorageError, StorageLayout};
pub use tracker::{
    AnnounceResponse, Announcer, HttpTracker, Peer, ScrapeStats, TrackerBackend, TrackerError,
    TrackerEvent, UdpTracker,
};
