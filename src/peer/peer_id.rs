use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// A 20-byte peer identifier.
///
/// Generated ids follow the Azureus style: the client prefix
/// [`CLIENT_PREFIX`] followed by twelve random bytes.
///
/// ```
/// use swarmbit::peer::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert_eq!(peer_id.client_id(), Some("SB0001"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..CLIENT_PREFIX.len()].copy_from_slice(CLIENT_PREFIX);
        rand::rng().fill(&mut id[CLIENT_PREFIX.len()..]);
        Self(id)
    }

    /// Returns `None` unless `bytes` is exactly 20 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The six-character client tag of an Azureus-style id.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({})", client),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_alphanumeric() || *byte == b'-' {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{:02x}", byte)?;
            }
        }
        Ok(())
    }
}
