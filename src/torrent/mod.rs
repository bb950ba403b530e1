//! Metainfo (.torrent) model and validation.
//!
//! Translates a decoded bencode tree into a typed torrent description:
//! announce URL, info-hash, per-piece SHA-1 manifest, and the output file
//! layout for single- and multi-file torrents.
use thiserror::Error;

pub mod info_hash;
pub mod metainfo;

pub use info_hash::InfoHash;
pub use metainfo::{FileEntry, FilePlan, Metainfo};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid data type for field: {0}")]
    InvalidFieldType(String),

    #[error("Pieces hash string length is not a multiple of 20")]
    InvalidPiecesHashLength,

    #[error("Torrent has no pieces")]
    EmptyPieces,

    #[error("Piece length must be at least 1, got {0}")]
    InvalidPieceLength(i64),

    #[error("Torrent declares both `length` and `files`")]
    ContradictoryFileFields,

    #[error("Piece count {hashes} does not cover total length {total} at piece length {piece_length}")]
    PieceCountMismatch {
        hashes: usize,
        total: u64,
        piece_length: u64,
    },

    #[error("Unsafe path component {0:?}")]
    UnsafePathComponent(String),
}

/// Result type for torrent operations derived from `std::result`
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
