//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! establishes basic protocol compatibility.
use super::{PeerError, PeerResult};
use crate::torrent::InfoHash;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const PROTOCOL_LEN: u8 = 19;

/// Serialized handshake size: length byte, protocol literal, 8 reserved
/// bytes, info hash, peer id.
pub const HANDSHAKE_LEN: usize = 68;

/// A BitTorrent handshake message.
///
/// Contains the protocol identifier ("BitTorrent protocol"), reserved bytes
/// for protocol extensions, the info hash identifying the torrent, and the
/// peer ID identifying the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Serializes the handshake into its fixed 68-byte wire form:
    /// `0x13 | "BitTorrent protocol" | 8 reserved | info_hash | peer_id`.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_LEN;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a received 68-byte handshake, checking the length byte and the
    /// protocol literal.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> PeerResult<Self> {
        if buf[0] != PROTOCOL_LEN {
            return Err(PeerError::InvalidProtocolLength(buf[0]));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(PeerError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Self {
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id,
        })
    }

    /// Reads a peer's handshake off the stream.
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await?;
        Self::parse(&buf)
    }

    /// Validates that this handshake's info hash matches the expected value.
    /// A mismatch means the peer is serving a different torrent and the
    /// connection must be dropped.
    pub fn validate(&self, expected_info_hash: InfoHash) -> PeerResult<()> {
        if self.info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_68_bytes() {
        let handshake = Handshake::new(InfoHash([0xaa; 20]), *b"-GB0001-abcdefghijkl");
        let bytes = handshake.serialize();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[0xaa; 20]);
        assert_eq!(&bytes[48..68], b"-GB0001-abcdefghijkl");
    }

    #[test]
    fn parse_round_trips() {
        let handshake = Handshake::new(InfoHash([0x11; 20]), *b"-GB0001-aaaaaaaaaaaa");
        let parsed = Handshake::parse(&handshake.serialize()).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn rejects_wrong_protocol_length() {
        let mut bytes = Handshake::new(InfoHash([0; 20]), [0; 20]).serialize();
        bytes[0] = 18;
        assert!(matches!(
            Handshake::parse(&bytes),
            Err(PeerError::InvalidProtocolLength(18))
        ));
    }

    #[test]
    fn rejects_wrong_protocol_literal() {
        let mut bytes = Handshake::new(InfoHash([0; 20]), [0; 20]).serialize();
        bytes[1] = b'X';
        assert!(matches!(
            Handshake::parse(&bytes),
            Err(PeerError::InvalidProtocol)
        ));
    }

    #[test]
    fn validate_detects_info_hash_mismatch() {
        let handshake = Handshake::new(InfoHash([1; 20]), [0; 20]);
        assert!(handshake.validate(InfoHash([1; 20])).is_ok());
        assert!(matches!(
            handshake.validate(InfoHash([2; 20])),
            Err(PeerError::InfoHashMismatch)
        ));
    }
}
