//! Session configuration.
//!
//! Every tunable lives here with the default the client ships with.
//! Protocol constants that are not meant to change sit in
//! [`constants`](crate::constants).

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::UDP_MAX_BACKOFF_EXPONENT;

/// A configuration value that cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid config field {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl ConfigError {
    fn new(field: &'static str, reason: &'static str) -> Self {
        Self { field, reason }
    }
}

/// Top-level configuration for a [`Session`](crate::session::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory the torrent's files are stored under.
    pub download_dir: PathBuf,

    /// Listen ports tried in order; the first free one is used.
    pub port_range: RangeInclusive<u16>,

    /// Number of one-tick buckets in the global transfer rate window.
    pub global_rate_window: usize,

    /// Period of the rate ticker.
    pub tick_interval: Duration,

    /// Create missing files and directories when writing.
    pub create_files: bool,

    pub peer: PeerConfig,
    pub tracker: TrackerConfig,
}

/// Peer-side limits and behaviour.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Upper bound on connections opened from tracker peer lists.
    pub max_connections: usize,

    /// Dropping below this many connections triggers one reannounce.
    pub low_water_mark: usize,

    /// Pending plus queued block requests kept per connection.
    pub request_depth: usize,

    /// Number of one-tick buckets in each connection's rate window.
    pub rate_window: usize,

    /// Peers we keep unchoked at once.
    pub unchoke_slots: usize,

    /// Period of the choke round and full interest recomputation.
    pub choke_interval: Duration,

    /// Advertise and honour the fast extension (BEP-6).
    pub fast_extension: bool,

    /// Withhold up to this many set bits from the initial bitfield and send
    /// them as `have` messages instead. Zero sends the plain bitfield.
    pub lazy_bitfield: usize,
}

/// Tracker announce scheduling.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Delay before retrying a tracker after a failure.
    pub retry_interval: Duration,

    /// Gap between successive tiers in one announce round.
    pub tier_stagger: Duration,

    /// Delay applied when a tracker is still busy with an earlier request.
    pub busy_retry_delay: Duration,

    /// Peers requested per announce; `None` leaves it to the tracker.
    pub numwant: Option<u32>,

    /// First UDP attempt timeout; attempt `n` waits `udp_timeout * 2^n`.
    pub udp_timeout: Duration,

    /// Additional UDP attempts after the first one times out.
    pub udp_retries: u32,

    pub http_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            port_range: 6881..=6889,
            global_rate_window: 3600,
            tick_interval: Duration::from_secs(1),
            create_files: true,
            peer: PeerConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            low_water_mark: 10,
            request_depth: 32,
            rate_window: 20,
            unchoke_slots: 4,
            choke_interval: Duration::from_secs(10),
            fast_extension: false,
            lazy_bitfield: 0,
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(3600),
            tier_stagger: Duration::from_secs(10),
            busy_retry_delay: Duration::from_secs(5),
            numwant: None,
            udp_timeout: Duration::from_secs(15),
            udp_retries: 2,
            http_timeout: Duration::from_secs(120),
        }
    }
}

impl SessionConfig {
    /// Checks the values a session cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_range.is_empty() {
            return Err(ConfigError::new("port_range", "range is empty"));
        }
        if self.global_rate_window == 0 {
            return Err(ConfigError::new("global_rate_window", "must be at least 1"));
        }
        if self.tick_interval.is_zero() {
            return Err(ConfigError::new("tick_interval", "must be non-zero"));
        }
        self.peer.validate()?;
        self.tracker.validate()
    }
}

impl PeerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::new("max_connections", "must be at least 1"));
        }
        if self.rate_window == 0 {
            return Err(ConfigError::new("rate_window", "must be at least 1"));
        }
        if self.request_depth == 0 {
            return Err(ConfigError::new("request_depth", "must be at least 1"));
        }
        Ok(())
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.udp_timeout.is_zero() {
            return Err(ConfigError::new("udp_timeout", "must be non-zero"));
        }
        if self.udp_retries > UDP_MAX_BACKOFF_EXPONENT {
            return Err(ConfigError::new("udp_retries", "must be at most 8"));
        }
        Ok(())
    }
}
