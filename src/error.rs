use thiserror::Error;

use crate::downloader::CallerId;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("segment is detached: {0}")]
    Detached(String),

    #[error("caller {caller} is not the downloader (current downloader: {downloader})")]
    NotDownloader {
        caller: CallerId,
        downloader: CallerId,
    },

    #[error("illegal segment state: {0}")]
    IllegalState(String),

    #[error("write of {requested} bytes exceeds reserved space ({available} bytes available)")]
    ReservationExceeded { requested: u64, available: u64 },

    #[error("write failed for segment {info}: {source}")]
    WriteFailed {
        info: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
