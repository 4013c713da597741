use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::constants::DEFAULT_ANNOUNCE_INTERVAL;
use crate::metainfo::InfoHash;
use crate::peer::PeerId;

/// A peer returned from a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub addr: SocketAddr,
    /// Only present in non-compact responses.
    pub peer_id: Option<PeerId>,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
        }
    }

    /// Parses one 6-byte compact record: IPv4 octets then a big-endian port.
    pub fn from_compact_v4(bytes: &[u8]) -> Option<Self> {
        let bytes: &[u8; 6] = bytes.try_into().ok()?;
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Some(Self::new(SocketAddr::new(IpAddr::V4(ip), port)))
    }
}

/// Expands a packed peer string. A trailing partial record is ignored.
pub fn parse_compact_peers(data: &[u8]) -> Vec<Peer> {
    data.chunks_exact(6)
        .filter_map(Peer::from_compact_v4)
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrackerEvent {
    #[default]
    None,
    Started,
    Stopped,
    Completed,
}

impl TrackerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackerEvent::None => "",
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        }
    }

    pub fn as_udp_id(&self) -> u32 {
        match self {
            TrackerEvent::None => 0,
            TrackerEvent::Completed => 1,
            TrackerEvent::Started => 2,
            TrackerEvent::Stopped => 3,
        }
    }
}

/// Transfer totals reported in an announce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Everything one announce sends, independent of the tracker protocol.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub stats: AnnounceStats,
    pub event: TrackerEvent,
    /// Random session key, fixed for the life of the client.
    pub key: u32,
    pub numwant: Option<u32>,
    /// Echo of the `tracker id` this tracker handed out earlier.
    pub tracker_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AnnounceResponse {
    pub interval: Option<u32>,
    pub min_interval: Option<u32>,
    pub min_request_interval: Option<u32>,
    /// Seeders.
    pub complete: Option<u32>,
    /// Leechers.
    pub incomplete: Option<u32>,
    pub peers: Vec<Peer>,
    pub warning_message: Option<String>,
    pub tracker_id: Option<String>,
}

impl AnnounceResponse {
    /// Delay before the next contact: the smallest interval field present,
    /// or the default when there is none.
    pub fn recontact_interval(&self) -> Duration {
        [self.min_request_interval, self.min_interval, self.interval]
            .into_iter()
            .flatten()
            .min()
            .map_or(DEFAULT_ANNOUNCE_INTERVAL, |secs| {
                Duration::from_secs(secs as u64)
            })
    }

    /// `(seeders, leechers)` when the tracker reported both.
    pub fn counts(&self) -> Option<(u32, u32)> {
        Some((self.complete?, self.incomplete?))
    }
}

/// Swarm counts for our torrent from a scrape.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Seeders.
    pub complete: u32,
    /// Leechers.
    pub incomplete: u32,
    /// Completed downloads ever reported.
    pub downloaded: u32,
}
