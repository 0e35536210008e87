//! Piece and block grid construction (spec §3, §4.2).
//!
//! Grounded in `NewPieces`/`GetBlock` from `internal/piece/piece.go`: a
//! single deterministic
//! cursor-walk builds every piece's section list and block grid from the
//! validated [`Info`] and the storage layout, with no further bookkeeping
//! needed afterwards.

use std::fs::File;
use std::sync::Arc;

use crate::block_count;
use crate::error::{Error, Result};
use crate::metainfo::Info;
use crate::sections::{FileSection, Sections};
use crate::storage_info::{FileInfo, FsStructure, StorageInfo};
use crate::{BlockInfo, PieceIndex};

/// A fixed-size chunk of a torrent (spec §3).
///
/// `sections` maps the piece's byte range onto the underlying files; it is
/// the sole path by which a piece's bytes are read or written (spec §4.1,
/// §4.6).
#[derive(Clone, Debug)]
pub struct Piece {
    pub index: PieceIndex,
    pub length: u32,
    pub sections: Sections,
    pub blocks: Vec<BlockInfo>,
}

impl Piece {
    /// Returns the block starting at byte `begin` within the piece, if
    /// `begin` lands on a block boundary (spec §4.2's block grid,
    /// grounded in `piece.go`'s `GetBlock`).
    pub fn block_at(&self, begin: u32) -> Option<&BlockInfo> {
        self.blocks.iter().find(|b| b.offset == begin)
    }
}

/// Opened file handles for a torrent's files, indexed the same way as
/// [`FsStructure`]'s file list (a single entry for a single-file torrent).
pub type FileHandles = Vec<Arc<File>>;

/// Builds the full piece and block grid for a torrent (spec §4.2).
///
/// `storage` must have been built from the same, already-validated `info`.
/// `files` are the torrent's open file handles, in the same order as
/// `storage.structure`'s file list.
pub fn build_pieces(
    info: &Info,
    storage: &StorageInfo,
    files: &FileHandles,
) -> Result<Vec<Piece>> {
    let mut pieces = Vec::with_capacity(storage.piece_count);
    for index in 0..storage.piece_count {
        pieces.push(build_piece(info, storage, files, index)?);
    }
    Ok(pieces)
}

fn build_piece(
    _info: &Info,
    storage: &StorageInfo,
    files: &FileHandles,
    index: PieceIndex,
) -> Result<Piece> {
    let length = storage.piece_len(index)?;
    let piece_offset = index as u64 * storage.piece_len as u64;
    let piece_end = piece_offset + length as u64;

    let sections = match &storage.structure {
        FsStructure::File(file) => {
            let handle = files.get(0).ok_or(Error::InvalidPieceIndex)?;
            Sections::new(vec![file_section(file, handle, piece_offset, length as u64)])
        }
        FsStructure::Archive { files: file_infos } => {
            let file_range = storage.files_intersecting_piece(index)?;
            let mut sections = Vec::with_capacity(file_range.len());
            for file_index in file_range {
                let file = &file_infos[file_index];
                let handle = files.get(file_index).ok_or(Error::InvalidPieceIndex)?;
                let slice = file.get_slice(
                    piece_offset.max(file.torrent_offset),
                    piece_end.min(file.torrent_end_offset())
                        - piece_offset.max(file.torrent_offset),
                );
                sections.push(FileSection {
                    file: Arc::clone(handle),
                    file_name: file.path.display().to_string(),
                    offset_in_file: slice.offset,
                    length: slice.len,
                });
            }
            Sections::new(sections)
        }
    };

    let blocks = (0..block_count(length))
        .map(|block_index| {
            let offset = block_index as u32 * crate::BLOCK_LEN;
            let len = crate::block_len(length, block_index);
            BlockInfo {
                piece_index: index,
                offset,
                len,
            }
        })
        .collect();

    Ok(Piece {
        index,
        length,
        sections,
        blocks,
    })
}

fn file_section(
    file: &FileInfo,
    handle: &Arc<File>,
    piece_offset: u64,
    length: u64,
) -> FileSection {
    let slice = file.get_slice(piece_offset, length);
    FileSection {
        file: Arc::clone(handle),
        file_name: file.path.display().to_string(),
        offset_in_file: slice.offset,
        length: slice.len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_bytes::ByteBuf;
    use std::path::PathBuf;

    fn open_tmp(tag: &str, len: u64) -> Arc<File> {
        let path = std::env::temp_dir().join(format!(
            "wirepeer-piece-test-{}-{}",
            tag,
            std::process::id()
        ));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.set_len(len).unwrap();
        Arc::new(file)
    }

    fn multi_file_info() -> (Info, StorageInfo, FileHandles) {
        // Spec's scenario 3: three files of 10/20/30 bytes, piece length 16.
        let info = Info {
            name: "multi".into(),
            pieces: ByteBuf::from(vec![0u8; 4 * 20]),
            piece_length: 16,
            length: None,
            files: Some(vec![
                crate::metainfo::File {
                    path: vec!["a".into()],
                    length: 10,
                },
                crate::metainfo::File {
                    path: vec!["b".into()],
                    length: 20,
                },
                crate::metainfo::File {
                    path: vec!["c".into()],
                    length: 30,
                },
            ]),
            private: None,
        };
        let storage = StorageInfo::new(&info, PathBuf::from("/tmp"));
        let files = vec![
            open_tmp("a", 10),
            open_tmp("b", 20),
            open_tmp("c", 30),
        ];
        (info, storage, files)
    }

    #[test]
    fn test_piece_count_and_last_piece_len() {
        let (_info, storage, _files) = multi_file_info();
        assert_eq!(storage.piece_count, 4);
        assert_eq!(storage.last_piece_len, 12);
    }

    #[test]
    fn test_build_pieces_covers_whole_torrent() {
        let (info, storage, files) = multi_file_info();
        let pieces = build_pieces(&info, &storage, &files).unwrap();
        assert_eq!(pieces.len(), 4);
        let total: u64 = pieces.iter().map(|p| p.sections.len()).sum();
        assert_eq!(total, storage.download_len);
        for (i, piece) in pieces.iter().enumerate() {
            assert_eq!(piece.sections.len(), storage.piece_len(i).unwrap() as u64);
        }
    }

    #[test]
    fn test_piece_zero_spans_first_two_files() {
        // piece 0: bytes [0,16) -> file a [0,10) fully, file b [0,6)
        let (info, storage, files) = multi_file_info();
        let pieces = build_pieces(&info, &storage, &files).unwrap();
        let piece0 = &pieces[0];
        assert_eq!(piece0.sections.0.len(), 2);
        assert_eq!(piece0.sections.0[0].length, 10);
        assert_eq!(piece0.sections.0[1].length, 6);
    }

    #[test]
    fn test_piece_three_is_last_and_spans_file_c_only() {
        // piece 3: bytes [48,60) entirely within file c ([30,60))
        let (info, storage, files) = multi_file_info();
        let pieces = build_pieces(&info, &storage, &files).unwrap();
        let last = &pieces[3];
        assert_eq!(last.length, 12);
        assert_eq!(last.sections.0.len(), 1);
        assert_eq!(last.sections.0[0].length, 12);
    }

    #[test]
    fn test_block_grid_matches_piece_length() {
        let (info, storage, files) = multi_file_info();
        let pieces = build_pieces(&info, &storage, &files).unwrap();
        // pieces 0..=2 are 16 bytes: one full 16 KiB-capped block (shorter
        // than BLOCK_LEN, so a single block).
        assert_eq!(pieces[0].blocks.len(), 1);
        assert_eq!(pieces[0].blocks[0].len, 16);
        // last piece is 12 bytes: also a single, shorter block.
        assert_eq!(pieces[3].blocks.len(), 1);
        assert_eq!(pieces[3].blocks[0].len, 12);
    }

    #[test]
    fn test_block_at_lookup() {
        let (info, storage, files) = multi_file_info();
        let pieces = build_pieces(&info, &storage, &files).unwrap();
        assert!(pieces[0].block_at(0).is_some());
        assert!(pieces[0].block_at(4).is_none());
    }
}
