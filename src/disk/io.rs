use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, OpenOptions},
    sync::Arc,
};

use sha1::{Digest, Sha1};
use tokio::{sync::mpsc, sync::RwLock, task};

use super::{
    Alert, AlertSender, BatchWrite, Command, CommandReceiver, CommandSender,
    NewTorrentError, TorrentAlert, TorrentAlertReceiver, TorrentAlertSender,
    TorrentAllocation, WriteError,
};
use crate::error::Result;
use crate::metainfo::Info;
use crate::piece::{build_pieces, FileHandles, Piece};
use crate::storage_info::{FsStructure, StorageInfo};
use crate::{BlockInfo, PieceIndex, Sha1Hash, TorrentId};

/// The entity responsible for saving downloaded file blocks to disk and
/// verifying whether downloaded pieces are valid.
pub struct Disk {
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
}

impl Disk {
    pub fn new() -> (Self, CommandSender, super::AlertReceiver) {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        )
    }

    /// Starts the disk event loop which runs until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::NewTorrent { id, info, storage } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation(Err(
                            NewTorrentError::AlreadyExists,
                        )))?;
                        continue;
                    }
                    match Torrent::new(info, storage) {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            let reader = TorrentReader {
                                pieces: Arc::new(torrent.pieces.clone()),
                            };
                            self.torrents.insert(id, RwLock::new(torrent));
                            self.alert_chan.send(Alert::TorrentAllocation(
                                Ok(TorrentAllocation { id, alert_port, reader }),
                            ))?;
                        }
                        Err(e) => {
                            log::warn!("Torrent {} allocation failure: {}", id, e);
                            self.alert_chan
                                .send(Alert::TorrentAllocation(Err(e)))?;
                        }
                    }
                }
                Command::WriteBlock { id, info, data } => {
                    self.write_block(id, info, data).await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn write_block(
        &self,
        id: TorrentId,
        info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            crate::error::Error::InvalidTorrentId
        })?;
        torrent.write().await.write_block(info, data).await
    }
}

/// Per-torrent storage state: the piece/section grid and the set of block
/// offsets received so far per in-progress piece.
struct Torrent {
    storage: StorageInfo,
    pieces: Vec<Piece>,
    /// Offsets of blocks written so far, per piece still in progress.
    /// Once a piece's set reaches its block count the piece is complete and
    /// removed from this map (spec §4.6).
    in_progress: HashMap<PieceIndex, BTreeSet<u32>>,
    piece_hashes: Vec<u8>,
    alert_chan: TorrentAlertSender,
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent, opens file
    /// handles, and builds the piece/section grid (spec §4.1, §4.2).
    fn new(
        info: Info,
        storage: StorageInfo,
    ) -> std::result::Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        let open_file = |path: &std::path::Path| -> std::result::Result<_, NewTorrentError> {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    fs::create_dir_all(parent).map_err(NewTorrentError::Io)?;
                }
            }
            let handle = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Arc::new(handle))
        };

        let files: FileHandles = match &storage.structure {
            FsStructure::File(file) => {
                let path = storage.download_dir.join(&file.path);
                vec![open_file(&path)?]
            }
            FsStructure::Archive { files } => {
                let mut handles = Vec::with_capacity(files.len());
                for file in files {
                    let path = storage.download_dir.join(&file.path);
                    handles.push(open_file(&path)?);
                }
                handles
            }
        };

        let pieces = build_pieces(&info, &storage, &files).map_err(|e| {
            NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                storage,
                pieces,
                in_progress: HashMap::new(),
                piece_hashes: info.pieces.to_vec(),
                alert_chan,
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    async fn write_block(&mut self, info: BlockInfo, data: Vec<u8>) -> Result<()> {
        log::trace!("Saving block {:?} to disk", info);

        let piece = match self.pieces.get(info.piece_index) {
            Some(piece) => piece.clone(),
            None => {
                log::warn!(
                    "Piece {} is invalid for torrent (have {} pieces)",
                    info.piece_index,
                    self.storage.piece_count
                );
                self.alert_chan.send(TorrentAlert::BatchWrite(Err(
                    WriteError::InvalidPieceIndex,
                )))?;
                return Ok(());
            }
        };

        let write_result = {
            let piece_for_write = piece.clone();
            let data_len = data.len();
            let result = task::spawn_blocking(move || {
                piece_for_write.sections.write_at(info.offset as u64, &data)
            })
            .await
            .expect("disk write task panicked");
            result.map(|_| data_len)
        };
        let written = match write_result {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Disk write error: {}", e);
                self.stats.write_failure_count += 1;
                self.alert_chan
                    .send(TorrentAlert::BatchWrite(Err(WriteError::from(e))))?;
                return Ok(());
            }
        };
        self.stats.write_count += written as u64;

        let received = self
            .in_progress
            .entry(info.piece_index)
            .or_insert_with(BTreeSet::new);
        received.insert(info.offset);

        if received.len() != piece.blocks.len() {
            // more blocks still outstanding for this piece
            self.alert_chan.send(TorrentAlert::BatchWrite(Ok(BatchWrite {
                blocks: vec![info],
                is_piece_valid: None,
            })))?;
            return Ok(());
        }

        // all blocks for this piece have arrived: verify its hash by
        // reading the bytes back from disk (spec §4.6)
        self.in_progress.remove(&info.piece_index);
        let expected_hash = self.expected_hash(info.piece_index)?;
        let piece_for_hash = piece.clone();
        let is_piece_valid = task::spawn_blocking(move || {
            matches_hash(&piece_for_hash, &expected_hash)
        })
        .await
        .expect("disk hash task panicked")?;

        if is_piece_valid {
            log::info!("Piece {} is valid", info.piece_index);
        } else {
            log::warn!("Piece {} is NOT valid", info.piece_index);
        }

        self.alert_chan.send(TorrentAlert::BatchWrite(Ok(BatchWrite {
            blocks: piece.blocks.clone(),
            is_piece_valid: Some(is_piece_valid),
        })))?;

        Ok(())
    }

    fn expected_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let start = index * 20;
        let end = start + 20;
        let slice = self
            .piece_hashes
            .get(start..end)
            .ok_or(crate::error::Error::InvalidPieceIndex)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(slice);
        Ok(hash)
    }
}

/// A cheaply cloneable, read-only handle onto a torrent's piece/section
/// grid, used by peer sessions to serve upload requests directly, without
/// contending with the disk task's single-consumer write path.
#[derive(Clone)]
pub struct TorrentReader {
    pieces: Arc<Vec<Piece>>,
}

impl TorrentReader {
    /// Reads a block's bytes back from disk for an upload reply (spec
    /// §4.5). Performs blocking I/O; callers must run this inside
    /// `task::spawn_blocking`.
    pub fn read_block_blocking(&self, info: BlockInfo) -> Result<Vec<u8>> {
        let piece = self
            .pieces
            .get(info.piece_index)
            .ok_or(crate::error::Error::InvalidPieceIndex)?;
        let mut buf = vec![0u8; info.len as usize];
        piece
            .sections
            .read_at(info.offset as u64, &mut buf)
            .map_err(WriteError::from)?;
        Ok(buf)
    }
}

/// Reads a piece's bytes back from disk and compares their hash against
/// the expected one (spec §4.6).
///
/// # Important
///
/// This performs blocking IO and hashing and must be run on a thread pool,
/// not the async executor.
fn matches_hash(piece: &Piece, expected: &Sha1Hash) -> Result<bool> {
    let mut buf = vec![0u8; piece.length as usize];
    piece
        .sections
        .read_at(0, &mut buf)
        .map_err(WriteError::from)?;
    let digest = Sha1::digest(&buf);
    Ok(digest.as_slice() == expected)
}

#[derive(Default)]
struct Stats {
    write_count: u64,
    write_failure_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;
    use sha1::{Digest as _, Sha1 as Sha1Hasher};

    fn single_file_torrent(dir: &std::path::Path) -> (Info, StorageInfo) {
        let data = b"hello wirepeer world!!!".to_vec(); // 23 bytes
        let piece_len = 16u32;
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            let digest = Sha1Hasher::digest(chunk);
            pieces.extend_from_slice(&digest);
        }
        let info = Info {
            name: "single.bin".into(),
            pieces: ByteBuf::from(pieces),
            piece_length: piece_len,
            length: Some(data.len() as u64),
            files: None,
            private: None,
        };
        let storage = StorageInfo::new(&info, dir.to_path_buf());
        (info, storage)
    }

    #[tokio::test]
    async fn test_write_block_completes_and_verifies_piece() {
        let dir = std::env::temp_dir().join(format!(
            "wirepeer-disk-test-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let (info, storage) = single_file_torrent(&dir);
        let (mut torrent, mut alert_port) = Torrent::new(info, storage).unwrap();

        let data = b"hello wirepeer w".to_vec(); // 16 bytes = first piece
        let block = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: data.len() as u32,
        };
        torrent.write_block(block, data).await.unwrap();

        let alert = alert_port.recv().await.unwrap();
        match alert {
            TorrentAlert::BatchWrite(Ok(batch)) => {
                assert_eq!(batch.is_piece_valid, Some(true));
            }
            TorrentAlert::BatchWrite(Err(e)) => panic!("unexpected error: {}", e),
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_write_block_invalid_piece_index_is_reported() {
        let dir = std::env::temp_dir().join(format!(
            "wirepeer-disk-test-invalid-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let (info, storage) = single_file_torrent(&dir);
        let (mut torrent, mut alert_port) = Torrent::new(info, storage).unwrap();

        let block = BlockInfo {
            piece_index: 99,
            offset: 0,
            len: 4,
        };
        torrent.write_block(block, vec![1, 2, 3, 4]).await.unwrap();

        let alert = alert_port.recv().await.unwrap();
        assert!(matches!(
            alert,
            TorrentAlert::BatchWrite(Err(WriteError::InvalidPieceIndex))
        ));

        let _ = fs::remove_dir_all(&dir);
    }
}
