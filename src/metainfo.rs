//! Parsing and validation of the bencoded `.torrent` metainfo file (spec §6).

use std::fmt;
use std::path::PathBuf;

use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};

use crate::storage_info::{FileInfo, FsStructure};
use crate::{InfoHash, PieceIndex};

/// Errors that can occur while parsing or validating a metainfo file.
///
/// These are category-5 (configuration) errors per spec §7: fatal at
/// startup, never recovered locally.
#[derive(Debug)]
pub enum Error {
    /// The bencoded bytes could not be decoded into a [`Metainfo`].
    Decode(serde_bencode::Error),
    /// `info.pieces` is not a multiple of 20 bytes.
    InvalidPiecesLength(usize),
    /// Neither `info.length` nor `info.files` was present, or both were.
    AmbiguousFileLayout,
    /// The sum of `info.files[].length` doesn't match the declared total,
    /// or a file/piece length was nonsensical (e.g. zero piece length).
    ImpossibleFileGeometry(String),
    /// Re-encoding `info` for hashing failed.
    Encode(serde_bencode::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "failed to decode metainfo: {}", e),
            Self::InvalidPiecesLength(len) => {
                write!(f, "info.pieces length {} is not a multiple of 20", len)
            }
            Self::AmbiguousFileLayout => write!(
                f,
                "metainfo must declare exactly one of info.length or info.files"
            ),
            Self::ImpossibleFileGeometry(msg) => {
                write!(f, "impossible file geometry: {}", msg)
            }
            Self::Encode(e) => write!(f, "failed to re-encode info dict: {}", e),
        }
    }
}

impl std::error::Error for Error {}

/// The parsed torrent description (spec §3, "Metainfo / Info").
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub announce: Option<String>,
    pub info: Info,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        serde_bencode::from_bytes(buf).map_err(Error::Decode)
    }

    /// Computes the SHA-1 of the bencoded `info` dictionary: the info hash
    /// that identifies this torrent in the swarm.
    pub fn info_hash(&self) -> Result<InfoHash, Error> {
        let info = serde_bencode::to_bytes(&self.info).map_err(Error::Encode)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Builds the validated, engine-ready [`Info`] description, checking
    /// the invariants named in spec §3 and §7 (category 5 errors).
    pub fn validate(&self) -> Result<(), Error> {
        self.info.validate()
    }

    /// The number of pieces, `N = ceil(T / L)` (spec §3).
    pub fn piece_count(&self) -> usize {
        self.info.piece_count()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: ByteBuf,
    #[serde(rename = "piece length")]
    pub piece_length: u32,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

impl Info {
    /// The total length of the torrent's content, in bytes.
    pub fn total_length(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length as u64).sum(),
            (None, None) => 0,
        }
    }

    /// `N = ceil(T / L)`, per spec §3.
    pub fn piece_count(&self) -> usize {
        let total = self.total_length();
        if self.piece_length == 0 {
            return 0;
        }
        ((total + self.piece_length as u64 - 1) / self.piece_length as u64) as usize
    }

    /// The concatenated, per-piece 20-byte SHA-1 hashes.
    pub fn piece_hashes(&self) -> &[u8] {
        &self.pieces
    }

    /// Returns the expected hash of piece `index`, or `None` if out of range.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<[u8; 20]> {
        let start = index * 20;
        let end = start + 20;
        let slice = self.pieces.get(start..end)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Checks the invariants spec §7 names as fatal configuration errors:
    /// the file layout must be unambiguous, lengths must be consistent, and
    /// the piece length must be a sensible positive power of two.
    pub fn validate(&self) -> Result<(), Error> {
        if self.pieces.len() % 20 != 0 {
            return Err(Error::InvalidPiecesLength(self.pieces.len()));
        }
        match (&self.length, &self.files) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::AmbiguousFileLayout)
            }
            _ => {}
        }
        if self.piece_length == 0 {
            return Err(Error::ImpossibleFileGeometry(
                "piece length must be nonzero".into(),
            ));
        }
        if !self.piece_length.is_power_of_two() {
            return Err(Error::ImpossibleFileGeometry(format!(
                "piece length {} is not a power of two",
                self.piece_length
            )));
        }
        let total = self.total_length();
        let expected_piece_count = self.piece_count();
        let actual_piece_count = self.pieces.len() / 20;
        if total > 0 && expected_piece_count != actual_piece_count {
            return Err(Error::ImpossibleFileGeometry(format!(
                "expected {} pieces for a {} byte torrent at piece length {}, \
                 but info.pieces declares {}",
                expected_piece_count, total, self.piece_length, actual_piece_count
            )));
        }
        if let Some(files) = &self.files {
            if files.is_empty() {
                return Err(Error::ImpossibleFileGeometry(
                    "multi-file torrent declares zero files".into(),
                ));
            }
            for file in files {
                if file.length < 0 {
                    return Err(Error::ImpossibleFileGeometry(format!(
                        "file {:?} has negative length {}",
                        file.path, file.length
                    )));
                }
                if file.path.is_empty() {
                    return Err(Error::ImpossibleFileGeometry(
                        "file entry has an empty path".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Converts the validated info dictionary into the [`FsStructure`]
    /// consumed by [`crate::storage_info::StorageInfo`] (spec §4.2).
    pub fn to_fs_structure(&self) -> FsStructure {
        match &self.files {
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.name),
                len: self.length.unwrap_or(0),
                torrent_offset: 0,
            }),
            Some(files) => {
                let mut torrent_offset = 0u64;
                let files = files
                    .iter()
                    .map(|f| {
                        let info = FileInfo {
                            path: f.path.iter().collect(),
                            len: f.length as u64,
                            torrent_offset,
                        };
                        torrent_offset += info.len;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with(piece_length: u32, length: u64, piece_count: usize) -> Info {
        Info {
            name: "test".into(),
            pieces: ByteBuf::from(vec![0u8; piece_count * 20]),
            piece_length,
            length: Some(length),
            files: None,
            private: None,
        }
    }

    #[test]
    fn test_piece_count_exact_multiple() {
        let info = info_with(16, 64, 4);
        assert_eq!(info.piece_count(), 4);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_piece_count_rounds_up() {
        let info = info_with(16, 70, 5);
        assert_eq!(info.piece_count(), 5);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_power_of_two_piece_length() {
        let info = info_with(17, 17, 1);
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ambiguous_layout() {
        let mut info = info_with(16, 32, 2);
        info.files = Some(vec![File {
            path: vec!["a".into()],
            length: 32,
        }]);
        assert!(matches!(info.validate(), Err(Error::AmbiguousFileLayout)));
    }

    #[test]
    fn test_validate_rejects_mismatched_pieces_length() {
        let info = info_with(16, 64, 3);
        assert!(info.validate().is_err());
    }

    #[test]
    fn test_to_fs_structure_multi_file() {
        let mut info = info_with(16, 0, 4);
        info.length = None;
        info.files = Some(vec![
            File {
                path: vec!["a".into()],
                length: 10,
            },
            File {
                path: vec!["b".into()],
                length: 20,
            },
            File {
                path: vec!["c".into()],
                length: 30,
            },
        ]);
        match info.to_fs_structure() {
            FsStructure::Archive { files } => {
                assert_eq!(files.len(), 3);
                assert_eq!(files[0].torrent_offset, 0);
                assert_eq!(files[1].torrent_offset, 10);
                assert_eq!(files[2].torrent_offset, 30);
            }
            FsStructure::File(_) => panic!("expected archive"),
        }
    }
}
