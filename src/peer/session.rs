//! The peer session run loop (spec §4.5), grounded in
//! `cratetorrent::peer::PeerSession::run`/`handle_msg`/`make_requests`,
//! generalized to serve both outbound and inbound peers and to route
//! bytes through the disk task rather than a torrent-local buffer.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use futures::{select, stream::Fuse, stream::SplitSink, FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::{self, Instant};
use tokio_util::codec::Framed;

use crate::disk::{self, TorrentReader};
use crate::error::{Error, Result};
use crate::events::Event;
use crate::handshake::{CipherStream, HandshakeResult};
use crate::wire::{Message, PeerCodec};
use crate::{Bitfield, BlockInfo, PeerId, TorrentId};

use super::{Command, Receiver, Sender};

/// The write half of a peer's framed connection.
type PeerSink = SplitSink<Framed<CipherStream, PeerCodec>, Message>;

/// The number of outstanding requests we allow ourselves to have in flight
/// towards a single peer at once (spec §4.5: "typically 10-16").
const MAX_IN_FLIGHT_REQUESTS: usize = 16;

/// Send a keep-alive after this much outbound idleness.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(120);

/// Drop the peer after this much inbound idleness.
const INBOUND_IDLE_TIMEOUT: Duration = Duration::from_millis(150_000);

/// How often the session checks elapsed idle time against the above.
const HEARTBEAT_TICK: Duration = Duration::from_secs(10);

/// Per-peer connection state (spec §4.5), independent of which side dialed.
#[derive(Clone, Copy, Debug)]
struct Status {
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// A live connection to a single peer, after handshaking (spec §4.5).
pub struct PeerSession {
    torrent_id: TorrentId,
    addr: SocketAddr,
    peer_id: PeerId,
    status: Status,
    /// The peer's announced piece availability; `None` until a `Bitfield`
    /// or the first `Have` arrives.
    peer_pieces: Bitfield,
    /// Our local piece availability, sent once at the start of the session.
    local_pieces: Bitfield,
    /// Requests we've sent but have not yet received a `Piece` for.
    in_flight: HashSet<BlockInfo>,
    /// Requests the driver asked for that exceed the in-flight cap; drained
    /// as `in_flight` entries complete.
    pending_requests: VecDeque<BlockInfo>,
    cmd_port: Fuse<Receiver>,
    disk: disk::CommandSender,
    reader: TorrentReader,
    events: mpsc::UnboundedSender<Event>,
    last_inbound: Instant,
    last_outbound: Instant,
}

impl PeerSession {
    /// Wraps a successfully handshaken connection and prepares to run it.
    pub fn new(
        handshake: &HandshakeResult,
        addr: SocketAddr,
        torrent_id: TorrentId,
        local_pieces: Bitfield,
        piece_count: usize,
        disk: disk::CommandSender,
        reader: TorrentReader,
        events: mpsc::UnboundedSender<Event>,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = super::channel();
        let now = Instant::now();
        (
            Self {
                torrent_id,
                addr,
                peer_id: handshake.peer_id,
                status: Status::default(),
                peer_pieces: std::iter::repeat(false).take(piece_count).collect(),
                local_pieces,
                in_flight: HashSet::new(),
                pending_requests: VecDeque::new(),
                cmd_port: cmd_port.fuse(),
                disk,
                reader,
                events,
                last_inbound: now,
                last_outbound: now,
            },
            cmd_chan,
        )
    }

    /// Runs the full-duplex session loop until the peer disconnects, a
    /// protocol error occurs, or the owner sends [`Command::Shutdown`].
    pub async fn run(mut self, stream: CipherStream) -> Result<()> {
        let socket = Framed::new(stream, PeerCodec::default());
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        let _ = self
            .events
            .send(Event::PeerConnected {
                torrent_id: self.torrent_id,
                addr: self.addr,
                peer_id: self.peer_id,
            });

        log::info!("Sending initial bitfield to peer {}", self.addr);
        sink.send(Message::Bitfield(self.local_pieces.clone()))
            .await?;
        self.last_outbound = Instant::now();

        let mut heartbeat = time::interval(HEARTBEAT_TICK);

        let result = loop {
            select! {
                msg = stream.select_next_some() => {
                    match msg {
                        Ok(msg) => {
                            self.last_inbound = Instant::now();
                            if let Err(e) = self.handle_message(&mut sink, msg).await {
                                break Err(e);
                            }
                        }
                        Err(e) => break Err(Error::InvalidMessage(e.to_string())),
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Request(block) => {
                            if let Err(e) = self.enqueue_request(&mut sink, block).await {
                                break Err(e);
                            }
                        }
                        Command::Cancel(block) => {
                            if let Err(e) = self.cancel_request(&mut sink, block).await {
                                break Err(e);
                            }
                        }
                        Command::SetInterested(interested) => {
                            if let Err(e) = self.set_interested(&mut sink, interested).await {
                                break Err(e);
                            }
                        }
                        Command::SetChoking(choking) => {
                            if let Err(e) = self.set_choking(&mut sink, choking).await {
                                break Err(e);
                            }
                        }
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break Ok(());
                        }
                    }
                }
                _ = heartbeat.tick().fuse() => {
                    let now = Instant::now();
                    if now.duration_since(self.last_inbound) >= INBOUND_IDLE_TIMEOUT {
                        log::warn!("Peer {} timed out", self.addr);
                        break Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "peer inbound idle timeout",
                        )));
                    }
                    if now.duration_since(self.last_outbound) >= KEEP_ALIVE_INTERVAL {
                        log::trace!("Sending keep-alive to peer {}", self.addr);
                        if let Err(e) = sink.send(Message::KeepAlive).await {
                            break Err(e.into());
                        }
                        self.last_outbound = now;
                    }
                }
            }
        };

        self.return_in_flight_requests();

        let _ = self.events.send(Event::PeerDisconnected {
            torrent_id: self.torrent_id,
            addr: self.addr,
            error: result.as_ref().err().map(|e| e.to_string()),
        });

        result
    }

    async fn handle_message(
        &mut self,
        sink: &mut PeerSink,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if !self.status.peer_choking {
                    log::info!("Peer {} choked us", self.addr);
                    self.status.peer_choking = true;
                    self.return_in_flight_requests();
                }
            }
            Message::Unchoke => {
                if self.status.peer_choking {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.peer_choking = false;
                }
            }
            Message::Interested => {
                self.status.peer_interested = true;
            }
            Message::NotInterested => {
                self.status.peer_interested = false;
            }
            Message::Have(piece_index) => {
                if piece_index < self.peer_pieces.len() {
                    self.peer_pieces.set(piece_index, true);
                    self.notify_availability_changed();
                }
            }
            Message::Bitfield(mut bitfield) => {
                bitfield.resize(self.peer_pieces.len(), false);
                self.peer_pieces = bitfield;
                self.notify_availability_changed();
            }
            Message::Request {
                piece_index,
                begin,
                length,
            } => {
                self.handle_request(sink, piece_index, begin, length).await?;
            }
            Message::Piece {
                piece_index,
                begin,
                block,
            } => {
                self.handle_piece(piece_index, begin, block).await?;
                self.drain_pending_requests(sink).await?;
            }
            Message::Cancel { .. } => {
                // We don't queue upload tasks beyond a single disk read, so
                // there's nothing in-flight on our side to cancel.
            }
            Message::Port(_) | Message::Extended { .. } => {
                // DHT port announcements and extension protocol messages
                // are accepted but not acted upon.
            }
        }
        Ok(())
    }

    fn notify_availability_changed(&self) {
        let _ = self.events.send(Event::PeerAvailabilityChanged {
            torrent_id: self.torrent_id,
            addr: self.addr,
            available_pieces: self.peer_pieces.clone(),
        });
    }

    async fn handle_request(
        &mut self,
        sink: &mut PeerSink,
        piece_index: crate::PieceIndex,
        begin: u32,
        length: u32,
    ) -> Result<()> {
        if self.status.am_choking {
            log::trace!(
                "Dropping request from choked peer {} for piece {}",
                self.addr,
                piece_index
            );
            return Ok(());
        }

        let info = BlockInfo {
            piece_index,
            offset: begin,
            len: length,
        };
        let reader = self.reader.clone();
        let block = task::spawn_blocking(move || reader.read_block_blocking(info))
            .await
            .expect("upload read task panicked");
        match block {
            Ok(data) => {
                sink.send(Message::Piece {
                    piece_index,
                    begin,
                    block: data,
                })
                .await?;
                self.last_outbound = Instant::now();
            }
            Err(e) => {
                log::warn!(
                    "Failed to read block {:?} for peer {}: {}",
                    info,
                    self.addr,
                    e
                );
            }
        }
        Ok(())
    }

    async fn handle_piece(
        &mut self,
        piece_index: crate::PieceIndex,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<()> {
        let info = BlockInfo {
            piece_index,
            offset: begin,
            len: block.len() as u32,
        };
        if !self.in_flight.remove(&info) {
            log::warn!(
                "Peer {} sent unsolicited block {:?}, dropping",
                self.addr,
                info
            );
            return Ok(());
        }

        self.disk.send(disk::Command::WriteBlock {
            id: self.torrent_id,
            info,
            data: block,
        })?;

        let _ = self.events.send(Event::BlockReceived {
            torrent_id: self.torrent_id,
            addr: self.addr,
            block: info,
        });

        Ok(())
    }

    async fn enqueue_request(
        &mut self,
        sink: &mut PeerSink,
        block: BlockInfo,
    ) -> Result<()> {
        if self.status.peer_choking {
            log::trace!(
                "Peer {} is choking us, queueing request for {:?}",
                self.addr,
                block
            );
            self.pending_requests.push_back(block);
            return Ok(());
        }
        if self.in_flight.len() >= MAX_IN_FLIGHT_REQUESTS {
            self.pending_requests.push_back(block);
            return Ok(());
        }
        self.send_request(sink, block).await
    }

    async fn drain_pending_requests(
        &mut self,
        sink: &mut PeerSink,
    ) -> Result<()> {
        while self.in_flight.len() < MAX_IN_FLIGHT_REQUESTS && !self.status.peer_choking {
            let block = match self.pending_requests.pop_front() {
                Some(block) => block,
                None => break,
            };
            self.send_request(sink, block).await?;
        }
        Ok(())
    }

    async fn send_request(
        &mut self,
        sink: &mut PeerSink,
        block: BlockInfo,
    ) -> Result<()> {
        sink.send(Message::Request {
            piece_index: block.piece_index,
            begin: block.offset,
            length: block.len,
        })
        .await?;
        self.in_flight.insert(block);
        self.last_outbound = Instant::now();
        Ok(())
    }

    async fn cancel_request(
        &mut self,
        sink: &mut PeerSink,
        block: BlockInfo,
    ) -> Result<()> {
        if self.in_flight.remove(&block) {
            sink.send(Message::Cancel {
                piece_index: block.piece_index,
                begin: block.offset,
                length: block.len,
            })
            .await?;
        } else {
            self.pending_requests.retain(|b| *b != block);
        }
        Ok(())
    }

    async fn set_interested(&mut self, sink: &mut PeerSink, interested: bool) -> Result<()> {
        if self.status.am_interested == interested {
            return Ok(());
        }
        self.status.am_interested = interested;
        let msg = if interested {
            Message::Interested
        } else {
            Message::NotInterested
        };
        sink.send(msg).await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    async fn set_choking(&mut self, sink: &mut PeerSink, choking: bool) -> Result<()> {
        if self.status.am_choking == choking {
            return Ok(());
        }
        self.status.am_choking = choking;
        let msg = if choking { Message::Choke } else { Message::Unchoke };
        sink.send(msg).await?;
        self.last_outbound = Instant::now();
        Ok(())
    }

    /// Returns every outstanding request to the driver for rescheduling
    /// (spec §4.5's termination semantics).
    fn return_in_flight_requests(&mut self) {
        let blocks: Vec<BlockInfo> = self
            .in_flight
            .drain()
            .chain(self.pending_requests.drain(..))
            .collect();
        if blocks.is_empty() {
            return;
        }
        log::debug!(
            "Returning {} request(s) to scheduler for peer {}",
            blocks.len(),
            self.addr
        );
        let _ = self.events.send(Event::RequestsAbandoned {
            torrent_id: self.torrent_id,
            addr: self.addr,
            blocks,
        });
    }
}
