use thiserror::Error;

use crate::config::ConfigError;
use crate::metainfo::MetainfoError;
use crate::storage::StorageError;
use crate::tracker::TrackerError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no free listen port in {start}..={end}")]
    NoFreePort { start: u16, end: u16 },
}
