//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default wirepeer client id.
pub const WIREPEER_CLIENT_ID: &PeerId = b"wp-00000000000000000";

/// The global configuration for the core and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub handshake: HandshakeConf,
    pub supervisor: SupervisorConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the user.
    /// It uses the default wirepeer client id, [`WIREPEER_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *WIREPEER_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
            handshake: HandshakeConf::default(),
            supervisor: SupervisorConf::default(),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
        }
    }
}

/// Configuration for the peer handshake (spec §4.4).
#[derive(Clone, Copy, Debug)]
pub struct HandshakeConf {
    /// Whether MSE/PE encryption may be negotiated at all when dialing out.
    pub encryption_enabled: bool,
    /// If set, skip the plaintext-first attempt and dial directly in MSE/PE
    /// mode. Implies `encryption_enabled`.
    pub encryption_forced: bool,
    /// If set, the accepter drops any inbound connection that isn't MSE/PE.
    pub require_encryption_inbound: bool,
    /// Deadline for the whole handshake (DH exchange, negotiation, and the
    /// plaintext BitTorrent handshake), per peer attempt.
    pub timeout: Duration,
}

impl Default for HandshakeConf {
    fn default() -> Self {
        Self {
            encryption_enabled: true,
            encryption_forced: false,
            require_encryption_inbound: false,
            // rain's btconn.Dial allows a full minute for the combined
            // handshake; we default to a tighter bound.
            timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for the connection supervisor (spec §4.7).
#[derive(Clone, Copy, Debug)]
pub struct SupervisorConf {
    /// Upper bound on concurrently accepted inbound connections, engine-wide.
    pub max_inbound: usize,
    /// Upper bound on concurrently dialed outbound connections, per transfer.
    pub max_outbound_per_transfer: usize,
}

impl Default for SupervisorConf {
    fn default() -> Self {
        Self {
            max_inbound: 200,
            max_outbound_per_transfer: 50,
        }
    }
}
