//! Tracker protocol (BEP-3, BEP-15, BEP-48)
//!
//! The [`Announcer`] ranks the torrent's tracker tiers, schedules announce
//! and scrape contacts and feeds the peers it learns about back to the
//! client. HTTP and UDP trackers are reached through [`NetworkBackend`];
//! any other [`TrackerBackend`] can stand in for it.

mod announcer;
mod error;
mod http;
mod ranking;
mod response;
mod schedule;
mod udp;

pub use announcer::{AnnounceHandler, Announcer, NetworkBackend, TrackerBackend};
pub use error::TrackerError;
pub use http::{announce_url, parse_announce, parse_scrape, scrape_url, url_encode, HttpTracker};
pub use ranking::{RankedTracker, TrackerRanking};
pub use response::{
    parse_compact_peers, AnnounceRequest, AnnounceResponse, AnnounceStats, Peer, ScrapeStats,
    TrackerEvent,
};
pub use schedule::{Contact, ContactKind, Schedule};
pub use udp::UdpTracker;
