use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(io::Error),

    #[error("http error: {0}")]
    Http(reqwest::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    /// `failure reason` from an HTTP tracker, or a UDP error packet.
    #[error("tracker returned error: {0}")]
    Failure(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("timeout")]
    Timeout,

    #[error("connection reset")]
    ConnectionReset,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("could not resolve {0}")]
    Unresolved(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// The announce URL has no `announce` path segment to turn into `scrape`.
    #[error("tracker does not support scrape")]
    ScrapeUnsupported,

    /// The request was abandoned because the announcer stopped.
    #[error("cancelled")]
    Cancelled,
}

impl TrackerError {
    /// Whether the tracker should be demoted and contacted again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrackerError::Io(_)
                | TrackerError::Http(_)
                | TrackerError::Bencode(_)
                | TrackerError::Failure(_)
                | TrackerError::InvalidResponse(_)
                | TrackerError::Timeout
                | TrackerError::ConnectionReset
                | TrackerError::ConnectionRefused
                | TrackerError::Unresolved(_)
        )
    }
}

impl From<io::Error> for TrackerError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => TrackerError::Timeout,
            io::ErrorKind::ConnectionRefused => TrackerError::ConnectionRefused,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                TrackerError::ConnectionReset
            }
            _ => TrackerError::Io(e),
        }
    }
}

impl From<reqwest::Error> for TrackerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TrackerError::Timeout
        } else {
            TrackerError::Http(e)
        }
    }
}
