//! The connection supervisor (spec §4.7): accepts inbound connections and
//! dials outbound ones, handshakes them, and spins up a [`PeerSession`] for
//! each, all under a pair of bounds so a single process never runs more
//! concurrent handshakes or connections than it can serve.
//!
//! Grounded in `librain/rain.go`'s `accepter()` (a buffered channel used as
//! an inbound admission semaphore) and `internal/peermanager/dialer.go`'s
//! `dialer`/`dialAndRun` (a limiter-gated dial loop drawing addresses from a
//! peer list), translated to a [`tokio::sync::Semaphore`] and a supplied
//! [`PeerAddressSource`] respectively. Unlike the Go original, the bound is
//! enforced inside each spawned task rather than by blocking the
//! accept/dial loop itself, since tokio 0.2's `Semaphore` only hands out
//! permits borrowed from `&self`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};

use crate::conf::{HandshakeConf, SupervisorConf};
use crate::contracts::{InfoHashRegistry, PeerAddressSource};
use crate::disk::{self, TorrentReader};
use crate::events::Event;
use crate::error::Result;
use crate::handshake::{self, HandshakeResult};
use crate::peer::PeerSession;
use crate::{Bitfield, ExtensionBits, InfoHash, PeerId, TorrentId};

/// How long to wait before re-polling an exhausted [`PeerAddressSource`].
const ADDRESS_SOURCE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Everything a spawned peer session needs that isn't specific to one
/// connection attempt.
#[derive(Clone)]
pub struct TorrentHandles {
    pub torrent_id: TorrentId,
    pub local_pieces: Bitfield,
    pub piece_count: usize,
    pub disk: disk::CommandSender,
    pub reader: TorrentReader,
    pub events: mpsc::UnboundedSender<Event>,
}

/// Accepts inbound peer connections, bounded engine-wide by
/// [`SupervisorConf::max_inbound`] (spec §4.7).
///
/// `lookup_torrent` resolves the info hash recovered during an encrypted
/// handshake's SKEY search, or read off a plaintext handshake, to the
/// handles of a torrent this process is serving; a connection whose info
/// hash doesn't resolve is dropped. Runs until the listener errors.
pub async fn run_inbound(
    mut listener: TcpListener,
    conf: SupervisorConf,
    handshake_conf: HandshakeConf,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
    registry: Arc<dyn InfoHashRegistry>,
    lookup_torrent: Arc<dyn Fn(InfoHash) -> Option<TorrentHandles> + Send + Sync>,
) {
    let limit = Arc::new(Semaphore::new(conf.max_inbound));
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("Inbound listener failed, stopping accepter: {}", e);
                return;
            }
        };

        let limit = Arc::clone(&limit);
        let registry = Arc::clone(&registry);
        let lookup_torrent = Arc::clone(&lookup_torrent);

        tokio::spawn(async move {
            let _permit = limit.acquire().await;
            if let Err(e) = accept_one(
                stream,
                addr,
                &handshake_conf,
                local_ext_bits,
                local_peer_id,
                registry.as_ref(),
                lookup_torrent.as_ref(),
            )
            .await
            {
                log::warn!("Inbound peer {} dropped: {}", addr, e);
            }
        });
    }
}

async fn accept_one(
    stream: TcpStream,
    addr: SocketAddr,
    handshake_conf: &HandshakeConf,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
    registry: &dyn InfoHashRegistry,
    lookup_torrent: &(dyn Fn(InfoHash) -> Option<TorrentHandles> + Send + Sync),
) -> Result<()> {
    let handshake = handshake::accept(
        stream,
        handshake_conf,
        registry,
        local_ext_bits,
        local_peer_id,
    )
    .await?;
    log::info!(
        "Accepted peer {} (cipher={:?}, client={})",
        addr,
        handshake.cipher,
        hex::encode(&handshake.peer_id[..8])
    );

    let handles = lookup_torrent(handshake.info_hash).ok_or(crate::error::Error::InvalidTorrentId)?;
    run_session(handshake, addr, handles).await
}

/// Dials and runs outbound peer connections for a single transfer, bounded
/// by [`SupervisorConf::max_outbound_per_transfer`] (spec §4.7).
///
/// Draws candidate addresses from `addrs` one at a time, restarting the
/// source whenever it's momentarily exhausted, until `stop` fires.
pub async fn run_outbound(
    mut addrs: Box<dyn PeerAddressSource>,
    conf: SupervisorConf,
    handshake_conf: HandshakeConf,
    info_hash: InfoHash,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
    handles: TorrentHandles,
    mut stop: mpsc::UnboundedReceiver<()>,
) {
    let limit = Arc::new(Semaphore::new(conf.max_outbound_per_transfer));
    loop {
        tokio::select! {
            _ = stop.recv() => return,
            addr = next_address(&mut addrs) => {
                let limit = Arc::clone(&limit);
                let handles = handles.clone();
                tokio::spawn(async move {
                    let _permit = limit.acquire().await;
                    if let Err(e) = dial_one(
                        addr,
                        &handshake_conf,
                        info_hash,
                        local_ext_bits,
                        local_peer_id,
                        handles,
                    )
                    .await
                    {
                        log::warn!("Outbound dial to {} failed: {}", addr, e);
                    }
                });
            }
        }
    }
}

/// Returns the next candidate address, restarting and backing off while
/// `addrs` is momentarily exhausted.
async fn next_address(addrs: &mut Box<dyn PeerAddressSource>) -> SocketAddr {
    loop {
        if let Some(addr) = addrs.next_addr() {
            return addr;
        }
        addrs.restart();
        tokio::time::delay_for(ADDRESS_SOURCE_RETRY_DELAY).await;
    }
}

async fn dial_one(
    addr: SocketAddr,
    handshake_conf: &HandshakeConf,
    info_hash: InfoHash,
    local_ext_bits: ExtensionBits,
    local_peer_id: PeerId,
    handles: TorrentHandles,
) -> Result<()> {
    let handshake =
        handshake::dial(addr, handshake_conf, info_hash, local_ext_bits, local_peer_id).await?;
    log::info!(
        "Connected to peer {} (cipher={:?}, client={})",
        addr,
        handshake.cipher,
        hex::encode(&handshake.peer_id[..8])
    );
    run_session(handshake, addr, handles).await
}

async fn run_session(handshake: HandshakeResult, addr: SocketAddr, handles: TorrentHandles) -> Result<()> {
    // the command sender `PeerSession::new` returns is the supervisor's hook
    // for driving interest/choking and requests (spec §4.5); wiring it to a
    // piece-picker/choking algorithm is the embedding engine's job
    // (contracts::BlockScheduler), out of scope here.
    let (session, _cmd_chan) = PeerSession::new(
        &handshake,
        addr,
        handles.torrent_id,
        handles.local_pieces,
        handles.piece_count,
        handles.disk,
        handles.reader,
        handles.events,
    );
    session.run(handshake.stream).await
}
