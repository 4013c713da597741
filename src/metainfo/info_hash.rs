use std::fmt;

use sha1::{Digest, Sha1};

use super::error::MetainfoError;

/// SHA-1 of a torrent's bencoded info dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hashes the raw bytes of an info dictionary.
    pub fn of_info(raw_info: &[u8]) -> Self {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&Sha1::digest(raw_info));
        Self(hash)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetainfoError> {
        let hash: [u8; 20] = bytes
            .try_into()
            .map_err(|_| MetainfoError::InvalidInfoHashLength)?;
        Ok(Self(hash))
    }

    pub fn from_hex(s: &str) -> Result<Self, MetainfoError> {
        let bytes = hex_decode(s).ok_or(MetainfoError::InvalidInfoHashLength)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().fold(String::with_capacity(40), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", self.to_hex())
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}
