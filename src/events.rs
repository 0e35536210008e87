//! The upward interface (spec §6): events this crate emits to whatever
//! embeds it (a torrent engine), so it can drive piece-picking, choking,
//! and progress reporting.

use std::net::SocketAddr;

use crate::{BlockInfo, Bitfield, PeerId, PieceIndex, TorrentId};

/// An event raised by a peer session or the connection supervisor, destined
/// for the embedding engine (spec §6).
#[derive(Debug)]
pub enum Event {
    /// A peer session finished its handshake and is ready to exchange
    /// messages.
    PeerConnected {
        torrent_id: TorrentId,
        addr: SocketAddr,
        peer_id: PeerId,
    },
    /// A peer session ended, gracefully or otherwise.
    PeerDisconnected {
        torrent_id: TorrentId,
        addr: SocketAddr,
        error: Option<String>,
    },
    /// A peer announced its piece availability, via bitfield or have
    /// messages.
    PeerAvailabilityChanged {
        torrent_id: TorrentId,
        addr: SocketAddr,
        available_pieces: Bitfield,
    },
    /// A block arrived from a peer and was handed to the disk task.
    BlockReceived {
        torrent_id: TorrentId,
        addr: SocketAddr,
        block: BlockInfo,
    },
    /// A piece's blocks are all written and its hash verified successfully
    /// (spec §4.6's "Piece verification" is out of scope for this crate;
    /// this event is raised by the embedder once it has verified the piece
    /// and wants the fact recorded for reporting).
    PieceCompleted {
        torrent_id: TorrentId,
        index: PieceIndex,
    },
    /// Requests this session had sent or queued were abandoned, either
    /// because the peer choked us or because the session is terminating
    /// (spec §4.5's "returned to the transfer for re-scheduling"). The
    /// embedder's `BlockScheduler` should treat each as a call to
    /// `on_request_failed`.
    RequestsAbandoned {
        torrent_id: TorrentId,
        addr: SocketAddr,
        blocks: Vec<BlockInfo>,
    },
}
