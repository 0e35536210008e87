//! The disk task (spec §4.6): owns all piece writers, serializes access to
//! a torrent's open file handles, and reports write/verification results
//! back to the engine over a per-torrent alert channel.
//!
//! Grounded in `cratetorrent::disk::io`'s actor loop: a single task drains
//! an mpsc command channel and never touches the network.

pub mod error;
mod io;

use tokio::sync::mpsc;

pub use error::{NewTorrentError, WriteError};
pub use io::{Disk, TorrentReader};

use crate::metainfo::Info;
use crate::storage_info::StorageInfo;
use crate::{BlockInfo, TorrentId};

pub type CommandSender = mpsc::UnboundedSender<Command>;
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;
pub type AlertSender = mpsc::UnboundedSender<Alert>;
pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub type TorrentAlertSender = mpsc::UnboundedSender<TorrentAlert>;
pub type TorrentAlertReceiver = mpsc::UnboundedReceiver<TorrentAlert>;

/// Commands accepted by the disk task.
pub enum Command {
    /// Allocates storage for a new torrent: creates the directory
    /// structure, opens file handles, and builds the piece/section grid
    /// (spec §4.2).
    NewTorrent {
        id: TorrentId,
        info: Info,
        storage: StorageInfo,
    },
    /// Writes a single block directly to its section of the file(s) it
    /// overlaps (spec §4.6): no in-memory buffering beyond the write
    /// itself.
    WriteBlock {
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    },
    Shutdown,
}

/// Engine-wide alerts from the disk task.
pub enum Alert {
    TorrentAllocation(Result<TorrentAllocation, NewTorrentError>),
}

/// The result of successfully allocating a torrent's storage.
pub struct TorrentAllocation {
    pub id: TorrentId,
    pub alert_port: TorrentAlertReceiver,
    /// A cheaply cloneable handle peer sessions use to serve upload
    /// requests (spec §4.5's "enqueue an upload task") without going
    /// through the single-consumer alert channel above, which is reserved
    /// for write/verification results.
    pub reader: io::TorrentReader,
}

/// Per-torrent alerts from the disk task.
pub enum TorrentAlert {
    BatchWrite(Result<BatchWrite, WriteError>),
}

/// The outcome of writing a block, and of verifying its piece if that was
/// the piece's last outstanding block.
pub struct BatchWrite {
    pub blocks: Vec<BlockInfo>,
    pub is_piece_valid: Option<bool>,
}

/// Spawns the disk task and returns the command sender and engine alert
/// receiver used to talk to it.
pub fn start() -> (CommandSender, AlertReceiver) {
    let (disk, cmd_chan, alert_port) = Disk::new();
    tokio::spawn(async move {
        let mut disk = disk;
        if let Err(e) = disk.start().await {
            log::error!("Disk task exited with error: {}", e);
        }
    });
    (cmd_chan, alert_port)
}
