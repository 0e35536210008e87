//! A single peer connection (spec §4.5): owns the framed, possibly
//! encrypted stream and runs the full-duplex message loop.
//!
//! Grounded in `cratetorrent::peer::PeerSession`'s state machine and
//! channel shape, generalized to serve both outbound (dialed) and inbound
//! (accepted) sessions, since handshaking now happens once, ahead of time,
//! in the `handshake` module rather than inline here.

mod session;

use tokio::sync::mpsc;

pub use session::PeerSession;

use crate::BlockInfo;

/// The channel on which other parts of the engine send commands to a
/// running peer session task.
pub type Sender = mpsc::UnboundedSender<Command>;
pub type Receiver = mpsc::UnboundedReceiver<Command>;

/// Commands a peer session accepts from its owner (spec §4.5's "driver
/// external to the peer session").
pub enum Command {
    /// Enqueues a block request to be sent as soon as the in-flight cap
    /// allows.
    Request(BlockInfo),
    /// Cancels a previously enqueued or in-flight request; if the request
    /// was already sent, a `Cancel` message is sent to the peer.
    Cancel(BlockInfo),
    /// Declares our interest in the peer's pieces, sending `Interested` or
    /// `NotInterested` if the state actually changes.
    SetInterested(bool),
    /// Changes whether we're choking the peer, sending `Choke` or
    /// `Unchoke` if the state actually changes.
    SetChoking(bool),
    /// Tears down the session.
    Shutdown,
}

/// Creates a new command channel for a peer session.
pub fn channel() -> (Sender, Receiver) {
    mpsc::unbounded_channel()
}
