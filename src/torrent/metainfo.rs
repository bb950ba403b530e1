//! Typed torrent description parsed from a metainfo file.
use crate::bencode::{self, BencodeValue};
use crate::torrent::info_hash::InfoHash;

use super::{TorrentError, TorrentResult};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::instrument;

/// A fully validated torrent description.
///
/// Immutable after construction; one instance drives a whole download run.
#[derive(Debug, PartialEq, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub info_hash: InfoHash,
    pub piece_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub name: String,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
    pub creation_date: Option<SystemTime>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

/// One output file, as a sanitized relative path plus its length.
///
/// For a single-file torrent the path is `[name]`; for a multi-file torrent
/// it is `[name, component...]`, so joining the segments under the output
/// directory always yields the final on-disk location.
#[derive(Debug, PartialEq, Clone)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

/// A file's place in the torrent's virtual byte stream: resolved output
/// path, starting offset, and length.
#[derive(Debug, PartialEq, Clone)]
pub struct FilePlan {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// Helper to parse the concatenated SHA-1 hashes from the `pieces` string.
///
/// The `pieces` key within the `info` dictionary is a single byte string that
/// concatenates one 20-byte SHA-1 hash per piece, in piece-index order.
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.is_empty() {
        return Err(TorrentError::EmptyPieces);
    }
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let hashes = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();
    Ok(hashes)
}

/// Rejects path components that could escape the output directory.
fn sanitize_component(component: &str) -> TorrentResult<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0')
    {
        return Err(TorrentError::UnsafePathComponent(component.to_string()));
    }
    Ok(())
}

fn required_str(dict: &BencodeValue, key: &str) -> TorrentResult<String> {
    let node = dict
        .get(key.as_bytes())
        .ok_or_else(|| TorrentError::MissingField(key.to_string()))?;
    node.as_str()
        .map(str::to_owned)
        .ok_or_else(|| TorrentError::InvalidFieldType(key.to_string()))
}

fn optional_str(dict: &BencodeValue, key: &str) -> Option<String> {
    dict.get(key.as_bytes())
        .and_then(BencodeValue::as_str)
        .map(str::to_owned)
}

/// Parses the `files` list of a multi-file torrent into sanitized entries,
/// each path prefixed with the torrent name.
fn parse_files(name: &str, files_node: &BencodeValue) -> TorrentResult<Vec<FileEntry>> {
    let list = files_node
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFieldType("files".to_string()))?;
    if list.is_empty() {
        return Err(TorrentError::MissingField("files (empty list)".to_string()));
    }

    let mut files = Vec::with_capacity(list.len());
    for file_node in list {
        let length = file_node
            .get(b"length")
            .and_then(BencodeValue::as_int)
            .ok_or_else(|| TorrentError::MissingField("file length".to_string()))?;
        let length = u64::try_from(length)
            .map_err(|_| TorrentError::InvalidFieldType("file length".to_string()))?;

        let path_node = file_node
            .get(b"path")
            .and_then(BencodeValue::as_list)
            .ok_or_else(|| TorrentError::MissingField("file path".to_string()))?;
        if path_node.is_empty() {
            return Err(TorrentError::MissingField("file path (empty)".to_string()));
        }

        let mut path = Vec::with_capacity(path_node.len() + 1);
        path.push(name.to_string());
        for part in path_node {
            let part = part
                .as_str()
                .ok_or_else(|| TorrentError::InvalidFieldType("file path".to_string()))?;
            sanitize_component(part)?;
            path.push(part.to_string());
        }

        files.push(FileEntry { path, length });
    }
    Ok(files)
}

impl Metainfo {
    /// Reads and parses a metainfo file from disk.
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> TorrentResult<Metainfo> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Parses metainfo bytes into a validated `Metainfo`.
    ///
    /// The info-hash is taken from the `info` node's preserved byte range, so
    /// it is exact even for metainfo files with unusual (but legal) encoding
    /// choices elsewhere in the document.
    pub fn parse(bytes: &[u8]) -> TorrentResult<Metainfo> {
        let root = bencode::decode(bytes)?;
        if root.as_dict().is_none() {
            return Err(TorrentError::InvalidFormat(
                "root is not a dictionary".to_string(),
            ));
        }

        let announce = required_str(&root, "announce")?;

        let info = root
            .get(b"info")
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;
        if info.as_dict().is_none() {
            return Err(TorrentError::InvalidFormat(
                "info is not a dictionary".to_string(),
            ));
        }
        let info_hash = InfoHash::from_info_node(info);

        let piece_length = info
            .get(b"piece length")
            .and_then(BencodeValue::as_int)
            .ok_or_else(|| TorrentError::MissingField("piece length".to_string()))?;
        if piece_length < 1 {
            return Err(TorrentError::InvalidPieceLength(piece_length));
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = info
            .get(b"pieces")
            .and_then(BencodeValue::as_bytes)
            .ok_or_else(|| TorrentError::MissingField("pieces".to_string()))?;
        let piece_hashes = parse_pieces(pieces_bytes)?;

        let name = required_str(info, "name")?;
        sanitize_component(&name)?;

        let length_node = info.get(b"length");
        let files_node = info.get(b"files");
        let files = match (length_node, files_node) {
            (Some(_), Some(_)) => return Err(TorrentError::ContradictoryFileFields),
            (Some(length), None) => {
                let length = length
                    .as_int()
                    .ok_or_else(|| TorrentError::InvalidFieldType("length".to_string()))?;
                let length = u64::try_from(length)
                    .map_err(|_| TorrentError::InvalidFieldType("length".to_string()))?;
                vec![FileEntry {
                    path: vec![name.clone()],
                    length,
                }]
            }
            (None, Some(files_node)) => parse_files(&name, files_node)?,
            (None, None) => {
                return Err(TorrentError::MissingField("length or files".to_string()))
            }
        };

        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let expected_pieces = total_length.div_ceil(piece_length);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(TorrentError::PieceCountMismatch {
                hashes: piece_hashes.len(),
                total: total_length,
                piece_length,
            });
        }

        let creation_date = root
            .get(b"creation date")
            .and_then(BencodeValue::as_int)
            .and_then(|secs| u64::try_from(secs).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
        let comment = optional_str(&root, "comment");
        let created_by = optional_str(&root, "created by");

        Ok(Metainfo {
            announce,
            info_hash,
            piece_length,
            piece_hashes,
            name,
            files,
            total_length,
            creation_date,
            comment,
            created_by,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Effective length of piece `index`.
    ///
    /// All pieces are `piece_length` long except possibly the last, which is
    /// `total_length - (num_pieces - 1) * piece_length`. When the total is an
    /// exact multiple of the piece length that formula still yields a full
    /// piece (a modulo here would wrongly yield zero).
    pub fn piece_size(&self, index: usize) -> u64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index + 1 < self.num_pieces() {
            self.piece_length
        } else {
            self.total_length - (self.num_pieces() as u64 - 1) * self.piece_length
        }
    }

    /// Resolves the on-disk layout under `out_dir`.
    ///
    /// Each file's offset is its position in the torrent's virtual byte
    /// stream (files concatenated in metainfo order).
    pub fn layout(&self, out_dir: &Path) -> Vec<FilePlan> {
        let mut offset = 0u64;
        self.files
            .iter()
            .map(|file| {
                let mut path = out_dir.to_path_buf();
                for component in &file.path {
                    path.push(component);
                }
                let plan = FilePlan {
                    path,
                    offset,
                    length: file.length,
                };
                offset += file.length;
                plan
            })
            .collect()
    }
}
