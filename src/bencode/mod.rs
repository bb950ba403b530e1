//! Bencode parsing and encoding.
//!
//! Bencode is the serialization format used by .torrent files and tracker
//! responses: integers, byte strings, lists, and dictionaries with sorted
//! byte-string keys. The decoder here works over an in-memory buffer and
//! records, for every value it produces, the exact byte range that value was
//! parsed from along with the SHA-1 digest of those bytes. That digest is how
//! the `info` dictionary's hash (the torrent's identity on the network) is
//! obtained without ever re-encoding the tree.
use sha1::{Digest, Sha1};
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_prefix};
pub use encoder::{encode, to_bytes};

/// Half-open byte range `[start, end)` of a value inside the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// The four bencode value shapes.
///
/// Dictionaries are stored as a key-sorted vector of pairs rather than a hash
/// map: the wire format requires keys in ascending byte order, the decoder
/// enforces that order, and keeping the pairs in that order makes re-encoding
/// byte-stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeKind {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(Vec<(Vec<u8>, BencodeValue)>),
}

/// A decoded bencode value plus the provenance needed to hash it.
///
/// `span` addresses the source buffer the value was decoded from and `digest`
/// is the SHA-1 over exactly those bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BencodeValue {
    pub kind: BencodeKind,
    pub span: Span,
    pub digest: [u8; 20],
}

impl BencodeValue {
    pub fn as_int(&self) -> Option<i64> {
        match self.kind {
            BencodeKind::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.kind {
            BencodeKind::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// The value as UTF-8 text, if it is a byte string holding valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            BencodeKind::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match &self.kind {
            BencodeKind::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[(Vec<u8>, BencodeValue)]> {
        match &self.kind {
            BencodeKind::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up `key` in a dictionary value.
    ///
    /// Returns `None` for non-dictionaries and for missing keys. Keys are
    /// sorted (the decoder guarantees it), so this is a binary search.
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        let dict = self.as_dict()?;
        dict.binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| &dict[i].1)
    }
}

/// Computes the SHA-1 digest of a byte slice.
pub(crate) fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    Sha1::digest(bytes).into()
}

/// Errors raised while decoding or encoding bencode data.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected end of input")]
    UnexpectedEof,

    #[error("Unexpected byte 0x{byte:02x} at offset {pos}")]
    Unexpected { byte: u8, pos: usize },

    #[error("Integer has a leading zero at offset {pos}")]
    InvalidLeadingZero { pos: usize },

    #[error("Negative zero at offset {pos}")]
    NegativeZero { pos: usize },

    #[error("Integer out of range at offset {pos}")]
    InvalidInteger { pos: usize },

    #[error("Byte string length overflows at offset {pos}")]
    LengthOverflow { pos: usize },

    #[error("Dictionary keys out of order at offset {pos}")]
    UnsortedKeys { pos: usize },

    #[error("Duplicate dictionary key at offset {pos}")]
    DuplicateKey { pos: usize },

    #[error("Trailing bytes after value, starting at offset {pos}")]
    TrailingGarbage { pos: usize },
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
