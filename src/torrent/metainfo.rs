//! Torrent metainfo
//!
//! Parses .torrent files (BEP 3) into the immutable metadata the swarm
//! runs on: infohash, name, trackers, file layout, piece length and the
//! per-piece SHA-1 list. The magnet path promotes wire-fetched metadata
//! through [`Metainfo::from_info_dict`] after its infohash check.

use sha1::{Digest, Sha1};
use std::path::PathBuf;

use super::bencode::{find_info_dict_bytes, BencodeValue};
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::storage::FileSpan;

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Parsed torrent metainfo. Immutable once constructed.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 hash of the bencoded info dictionary
    pub info_hash: Sha1Hash,
    /// The parsed info dictionary
    pub info: Info,
    /// Primary announce URL
    pub announce: Option<String>,
    /// Announce list (BEP 12) - list of tiers, each tier a list of trackers
    pub announce_list: Vec<Vec<String>>,
}

/// The info dictionary
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory
    pub name: String,
    /// Number of bytes per piece
    pub piece_length: u64,
    /// SHA-1 hash of each piece
    pub pieces: Vec<Sha1Hash>,
    /// Files in this torrent
    pub files: Vec<FileInfo>,
    /// Total size of all files
    pub total_size: u64,
    /// Whether this is a single-file torrent
    pub is_single_file: bool,
    /// Private flag (BEP 27) - if true, disable DHT/PEX
    pub private: bool,
}

/// Information about a single file in the torrent
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path components (for multi-file) or just filename (for single-file)
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset in the concatenated file stream
    pub offset: u64,
}

impl Metainfo {
    /// Parse a .torrent file from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        let dict = root.as_dict().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::InvalidTorrent, "root must be a dictionary")
        })?;

        // The infohash is SHA-1 over the exact raw info-dict bytes.
        let info_bytes = find_info_dict_bytes(data)?;
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let info_hash: Sha1Hash = hasher.finalize().into();

        let info_value = dict.get(b"info".as_slice()).ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::InvalidTorrent, "missing 'info' key")
        })?;
        let info = Self::parse_info(info_value)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_string())
            .map(String::from);

        let announce_list = Self::parse_announce_list(dict.get(b"announce-list".as_slice()));

        Ok(Metainfo {
            info_hash,
            info,
            announce,
            announce_list,
        })
    }

    /// Build a `Metainfo` from a bare info dictionary (the BEP 9 payload).
    ///
    /// The caller has already verified `SHA-1(data) == info_hash`; trackers
    /// come from the magnet link, not from here.
    pub fn from_info_dict(data: &[u8], info_hash: Sha1Hash, trackers: Vec<String>) -> Result<Self> {
        let info_value = BencodeValue::parse_exact(data)?;
        let info = Self::parse_info(&info_value)?;

        Ok(Metainfo {
            info_hash,
            info,
            announce: trackers.first().cloned(),
            announce_list: if trackers.is_empty() {
                Vec::new()
            } else {
                vec![trackers]
            },
        })
    }

    fn parse_info(value: &BencodeValue) -> Result<Info> {
        let dict = value.as_dict().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::InvalidTorrent, "'info' must be a dictionary")
        })?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_string())
            .ok_or_else(|| {
                EngineError::protocol(ProtocolErrorKind::InvalidTorrent, "missing 'name' in info")
            })?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| {
                EngineError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    "missing or invalid 'piece length'",
                )
            })?;

        if piece_length == 0 {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                "'piece length' must be greater than zero",
            ));
        }

        let pieces_bytes = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| {
                EngineError::protocol(ProtocolErrorKind::InvalidTorrent, "missing 'pieces'")
            })?;

        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                format!(
                    "invalid pieces length: {} (not a multiple of 20)",
                    pieces_bytes.len()
                ),
            ));
        }

        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let private = dict
            .get(b"private".as_slice())
            .and_then(|v| v.as_int())
            .map(|v| v == 1)
            .unwrap_or(false);

        let (files, total_size, is_single_file) = if dict.contains_key(b"files".as_slice()) {
            let (files, total_size) = Self::parse_files(dict.get(b"files".as_slice()).unwrap())?;
            (files, total_size, false)
        } else {
            let length = dict
                .get(b"length".as_slice())
                .and_then(|v| v.as_uint())
                .ok_or_else(|| {
                    EngineError::protocol(
                        ProtocolErrorKind::InvalidTorrent,
                        "missing 'length' for single-file torrent",
                    )
                })?;

            let file = FileInfo {
                path: PathBuf::from(&name),
                length,
                offset: 0,
            };

            (vec![file], length, true)
        };

        let expected_pieces = total_size.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(EngineError::protocol(
                ProtocolErrorKind::InvalidTorrent,
                format!(
                    "piece count mismatch: have {}, expected {} for {} bytes with {} byte pieces",
                    pieces.len(),
                    expected_pieces,
                    total_size,
                    piece_length
                ),
            ));
        }

        Ok(Info {
            name,
            piece_length,
            pieces,
            files,
            total_size,
            is_single_file,
            private,
        })
    }

    fn parse_files(value: &BencodeValue) -> Result<(Vec<FileInfo>, u64)> {
        let files_list = value.as_list().ok_or_else(|| {
            EngineError::protocol(ProtocolErrorKind::InvalidTorrent, "'files' must be a list")
        })?;

        let mut files = Vec::new();
        let mut offset = 0u64;

        for file_value in files_list {
            let file_dict = file_value.as_dict().ok_or_else(|| {
                EngineError::protocol(
                    ProtocolErrorKind::InvalidTorrent,
                    "file entry must be a dictionary",
                )
            })?;

            let length = file_dict
                .get(b"length".as_slice())
                .and_then(|v| v.as_uint())
                .ok_or_else(|| {
                    EngineError::protocol(
                        ProtocolErrorKind::InvalidTorrent,
                        "missing 'length' in file entry",
                    )
                })?;

            let path_list = file_dict
                .get(b"path".as_slice())
                .and_then(|v| v.as_list())
                .ok_or_else(|| {
                    EngineError::protocol(
                        ProtocolErrorKind::InvalidTorrent,
                        "'path' must be a list of strings",
                    )
                })?;

            let mut path = PathBuf::new();
            for component in path_list {
                let component_str = component.as_string().ok_or_else(|| {
                    EngineError::protocol(
                        ProtocolErrorKind::InvalidTorrent,
                        "path component must be a string",
                    )
                })?;
                path.push(component_str);
            }

            files.push(FileInfo {
                path,
                length,
                offset,
            });

            offset += length;
        }

        Ok((files, offset))
    }

    fn parse_announce_list(value: Option<&BencodeValue>) -> Vec<Vec<String>> {
        let Some(tiers) = value.and_then(|v| v.as_list()) else {
            return Vec::new();
        };

        tiers
            .iter()
            .filter_map(|tier| {
                tier.as_list().map(|urls| {
                    urls.iter()
                        .filter_map(|url| url.as_string().map(String::from))
                        .collect()
                })
            })
            .filter(|tier: &Vec<String>| !tier.is_empty())
            .collect()
    }

    /// Get the info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Get the piece hash for a given piece index
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.info.pieces.get(index)
    }

    /// Get the byte range `[start, end)` for a piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.info.pieces.len() {
            return None;
        }

        let start = index as u64 * self.info.piece_length;
        let end = std::cmp::min(start + self.info.piece_length, self.info.total_size);
        Some((start, end))
    }

    /// Get the length of a piece (last piece may be shorter)
    pub fn piece_length(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Get all trackers (combining announce and announce_list)
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();

        if let Some(ref announce) = self.announce {
            trackers.push(announce.clone());
        }

        for tier in &self.announce_list {
            for url in tier {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }

        trackers
    }

    /// Destination file spans for the storage layer, relative to the
    /// download directory (multi-file torrents nest under the torrent name).
    pub fn file_spans(&self) -> Vec<FileSpan> {
        self.info
            .files
            .iter()
            .map(|file| FileSpan {
                path: if self.info.is_single_file {
                    file.path.clone()
                } else {
                    PathBuf::from(&self.info.name).join(&file.path)
                },
                length: file.length,
            })
            .collect()
    }
}

impl Info {
    /// Get the total number of pieces
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_torrent() -> Vec<u8> {
        // Single file "test.txt" of 100 bytes, one 32 KiB piece.
        let pieces = vec![0u8; 20];
        let pieces_str = format!("6:pieces{}:", pieces.len());

        let mut data = Vec::new();
        data.extend_from_slice(b"d");
        data.extend_from_slice(b"8:announce35:http://tracker.example.com/announce");
        data.extend_from_slice(b"4:infod");
        data.extend_from_slice(b"6:lengthi100e");
        data.extend_from_slice(b"4:name8:test.txt");
        data.extend_from_slice(b"12:piece lengthi32768e");
        data.extend_from_slice(pieces_str.as_bytes());
        data.extend_from_slice(&pieces);
        data.extend_from_slice(b"ee");

        data
    }

    #[test]
    fn parse_single_file_torrent() {
        let data = create_test_torrent();
        let metainfo = Metainfo::parse(&data).unwrap();

        assert_eq!(metainfo.info.name, "test.txt");
        assert_eq!(metainfo.info.piece_length, 32768);
        assert_eq!(metainfo.info.total_size, 100);
        assert_eq!(metainfo.info.pieces.len(), 1);
        assert!(metainfo.info.is_single_file);
        assert_eq!(
            metainfo.announce,
            Some("http://tracker.example.com/announce".to_string())
        );
        assert_eq!(metainfo.info_hash_hex().len(), 40);
    }

    #[test]
    fn piece_range_clamps_to_total_size() {
        let data = create_test_torrent();
        let metainfo = Metainfo::parse(&data).unwrap();

        assert_eq!(metainfo.piece_range(0), Some((0, 100)));
        assert_eq!(metainfo.piece_length(0), Some(100));
        assert!(metainfo.piece_range(1).is_none());
    }

    #[test]
    fn from_info_dict_matches_full_parse() {
        let data = create_test_torrent();
        let metainfo = Metainfo::parse(&data).unwrap();

        let info_bytes = super::super::bencode::find_info_dict_bytes(&data).unwrap();
        let rebuilt = Metainfo::from_info_dict(
            info_bytes,
            metainfo.info_hash,
            vec!["http://tracker.example.com/announce".to_string()],
        )
        .unwrap();

        assert_eq!(rebuilt.info.name, metainfo.info.name);
        assert_eq!(rebuilt.info.total_size, metainfo.info.total_size);
        assert_eq!(rebuilt.all_trackers().len(), 1);
    }

    #[test]
    fn multi_file_spans_nest_under_name() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d4:infod");
        data.extend_from_slice(b"5:filesl");
        data.extend_from_slice(b"d6:lengthi3e4:pathl1:aeee");
        data.extend_from_slice(b"4:name3:dir");
        data.extend_from_slice(b"12:piece lengthi16384e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");

        let metainfo = Metainfo::parse(&data).unwrap();
        assert!(!metainfo.info.is_single_file);
        let spans = metainfo.file_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].path, PathBuf::from("dir").join("a"));
    }

    #[test]
    fn invalid_torrents_are_rejected() {
        // Missing info dict
        assert!(Metainfo::parse(b"d8:announce10:http://fooe").is_err());

        // Pieces blob not a multiple of 20
        let data = b"d4:infod6:lengthi100e4:name4:test12:piece lengthi1024e6:pieces5:12345ee";
        assert!(Metainfo::parse(data).is_err());
    }
}
