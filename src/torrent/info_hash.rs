use crate::bencode::BencodeValue;

use std::fmt;

/// The 20-byte SHA-1 of the `info` dictionary's original bencoded bytes.
///
/// This is the torrent's identity everywhere on the network: the tracker
/// announce carries it and both sides of the peer handshake must present it.
/// It is taken from the decoder's per-node digest, so it hashes exactly the
/// bytes that appeared in the metainfo file, never a re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Reads the digest off an `info` node produced by the bencode decoder.
    pub fn from_info_node(node: &BencodeValue) -> Self {
        Self(node.digest)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}
