use crate::tracker::AnnounceStats;

/// Byte counters for the whole torrent.
///
/// Counters only change through [`apply`](Self::apply), so every update is
/// a single step under whatever lock guards the value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    uploaded: u64,
    downloaded: u64,
    left: u64,
    wasted: u64,
}

/// One update to [`TransferTotals`]. Byte counts are added; `left`, when
/// present, replaces the stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferDelta {
    pub uploaded: u64,
    pub downloaded: u64,
    pub wasted: u64,
    pub left: Option<u64>,
}

impl TransferDelta {
    pub fn transferred(uploaded: u64, downloaded: u64, wasted: u64) -> Self {
        Self {
            uploaded,
            downloaded,
            wasted,
            left: None,
        }
    }

    pub fn left(left: u64) -> Self {
        Self {
            left: Some(left),
            ..Self::default()
        }
    }
}

impl TransferTotals {
    pub fn new(left: u64) -> Self {
        Self {
            left,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, delta: TransferDelta) {
        self.uploaded = self.uploaded.saturating_add(delta.uploaded);
        self.downloaded = self.downloaded.saturating_add(delta.downloaded);
        self.wasted = self.wasted.saturating_add(delta.wasted);
        if let Some(left) = delta.left {
            self.left = left;
        }
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn left(&self) -> u64 {
        self.left
    }

    /// Bytes received that were already present.
    pub fn wasted(&self) -> u64 {
        self.wasted
    }

    pub fn announce_stats(&self) -> AnnounceStats {
        AnnounceStats {
            uploaded: self.uploaded,
            downloaded: self.downloaded,
            left: self.left,
        }
    }
}
