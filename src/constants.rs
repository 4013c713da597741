//! Protocol constants and default tuning values.

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Azureus-style peer id prefix.
pub const CLIENT_PREFIX: &[u8; 8] = b"-SB0001-";

// ============================================================================
// Peer wire protocol
// ============================================================================

/// Protocol string carried in every handshake.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// `pstrlen` + `pstr` + reserved + info_hash + peer_id.
pub const HANDSHAKE_LEN: usize = 68;

/// Size of a wire-level block request.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Reserved-byte bit advertising the fast extension (BEP-6).
pub const FAST_EXTENSION_BIT: (usize, u8) = (7, 0x04);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle time after which a keep-alive is sent.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Largest block a peer may request from us.
pub const MAX_REQUEST_LEN: u32 = 128 * 1024;

// ============================================================================
// Request pipeline
// ============================================================================

/// In-flight window of a fresh connection.
pub const MIN_PIPELINE_WINDOW: usize = 2;

/// Download bytes per second that earn one extra in-flight slot.
pub const PIPELINE_BYTES_PER_SLOT: u64 = 10_000;

// ============================================================================
// Trackers
// ============================================================================

/// Magic connection id sent in a UDP connect request (BEP-15).
pub const UDP_PROTOCOL_ID: u64 = 0x0417_2710_1980;

/// How long a UDP connection id stays valid.
pub const UDP_CONNECTION_TTL: Duration = Duration::from_secs(60);

/// Largest `n` in the `timeout * 2^n` wait between UDP attempts (BEP-15).
pub const UDP_MAX_BACKOFF_EXPONENT: u32 = 8;

/// Used when a tracker response carries no interval at all.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(3600);
