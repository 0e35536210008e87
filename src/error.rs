//! Crate-wide error types.
//!
//! Each module that can fail in more than one way defines its own narrower
//! error enum (`handshake::Error`, `disk::WriteError`, `disk::NewTorrentError`,
//! `metainfo::Error`); this top-level `Error` is what transport and session
//! code converges on once it needs to report across module boundaries.

use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The aggregate error type returned by peer session and supervisor code.
#[derive(Debug)]
pub enum Error {
    /// A socket read/write failed or the connection was reset.
    Io(std::io::Error),
    /// The handshake (plain or MSE/PE) could not be completed.
    Handshake(crate::handshake::Error),
    /// A decoded wire message violated the framing contract (spec §4.3).
    InvalidMessage(String),
    /// The peer did not identify itself as a seed while we only support
    /// downloading (no piece availability mechanism beyond a full bitfield).
    PeerNotSeed,
    /// Peer announced an info hash we don't recognize for this session.
    InvalidPeerInfoHash,
    /// Peer sent a bitfield message outside the availability-exchange state.
    BitfieldNotAfterHandshake,
    /// A disk write failed fatally for the torrent.
    Write(crate::disk::WriteError),
    /// Operation referred to a torrent id the disk actor doesn't know.
    InvalidTorrentId,
    /// Operation referred to a piece index outside `[0, piece_count)`.
    InvalidPieceIndex,
    /// An internal channel was disconnected (the other end of the channel
    /// was dropped, usually because the owning task has shut down).
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::Handshake(e) => write!(f, "handshake error: {}", e),
            Self::InvalidMessage(msg) => write!(f, "invalid message: {}", msg),
            Self::PeerNotSeed => write!(f, "peer is not a seed"),
            Self::InvalidPeerInfoHash => {
                write!(f, "peer advertised an unexpected info hash")
            }
            Self::BitfieldNotAfterHandshake => {
                write!(f, "peer sent bitfield outside availability exchange")
            }
            Self::Write(e) => write!(f, "disk write error: {}", e),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::ChannelClosed => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Handshake(e) => Some(e),
            Self::Write(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<crate::handshake::Error> for Error {
    fn from(e: crate::handshake::Error) -> Self {
        Self::Handshake(e)
    }
}

impl From<crate::wire::codec::Error> for Error {
    fn from(e: crate::wire::codec::Error) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}

impl From<crate::disk::WriteError> for Error {
    fn from(e: crate::disk::WriteError) -> Self {
        Self::Write(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}
