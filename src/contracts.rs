//! Collaborator contracts the core consumes (spec §6): trait boundaries
//! for the tracker/DHT, piece-picker, and choking subsystems this crate
//! does not implement (Non-goals), but calls through.

use std::net::SocketAddr;

use crate::{InfoHash, PieceIndex};

/// Produces candidate peer addresses for a transfer: a lazy, unbounded,
/// restartable sequence (spec §6).
pub trait PeerAddressSource: Send {
    /// Returns the next candidate address, or `None` if the source is
    /// temporarily exhausted (the supervisor may call [`Self::restart`]
    /// and try again later).
    fn next_addr(&mut self) -> Option<SocketAddr>;

    /// Restarts the sequence, e.g. after a tracker re-announce.
    fn restart(&mut self);
}

/// Resolves which torrent an inbound MSE/PE connection belongs to (spec
/// §4.4.3, §6).
pub trait InfoHashRegistry: Send + Sync {
    /// Whether `info_hash` belongs to a transfer this process is serving.
    fn is_known(&self, info_hash: &InfoHash) -> bool;

    /// Looks up the info hash whose `HASH('req2', info_hash)` equals
    /// `hash20`, the responder's side of the MSE SKEY recovery (spec
    /// §4.4.4).
    fn skey(&self, hash20: &[u8; 20]) -> Option<InfoHash>;
}

/// Supplies the next block to request from a given peer and consumes
/// completion/failure notifications (spec §6). Implemented by the
/// embedding engine's piece-picker.
pub trait BlockScheduler: Send {
    /// Returns the next `(piece, begin, length)` to request from the peer
    /// with the given available pieces, or `None` if nothing is currently
    /// requestable (e.g. the peer has nothing we need, or we're at the
    /// in-flight cap).
    fn next_request(&mut self, peer_pieces: &crate::Bitfield) -> Option<(PieceIndex, u32, u32)>;

    /// Called when a requested block arrives.
    fn on_block_received(&mut self, piece: PieceIndex, begin: u32);

    /// Called when a request could not be completed (peer disconnected,
    /// choked, or canceled) so it can be rescheduled.
    fn on_request_failed(&mut self, piece: PieceIndex, begin: u32, length: u32);
}
