//! Errors raised by the disk task (spec §7, category 4).

use std::fmt;

/// Failure to allocate storage for a new torrent.
#[derive(Debug)]
pub enum NewTorrentError {
    Io(std::io::Error),
    AlreadyExists,
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error allocating torrent storage: {}", e),
            Self::AlreadyExists => write!(f, "torrent id already allocated"),
        }
    }
}

impl std::error::Error for NewTorrentError {}

/// Failure to write a block or verify a piece (spec §4.6).
#[derive(Debug)]
pub enum WriteError {
    Io(std::io::Error),
    Sections(crate::sections::Error),
    InvalidPieceIndex,
    InvalidTorrentId,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Sections(e) => write!(f, "section write error: {}", e),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<crate::sections::Error> for WriteError {
    fn from(e: crate::sections::Error) -> Self {
        Self::Sections(e)
    }
}
