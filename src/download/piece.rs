//! Per-piece block bookkeeping and verification.
use crate::peer::{PeerError, PeerResult};

use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

/// Fixed transfer block size. A piece of effective length `P` is fetched as
/// `ceil(P / 16 KiB)` blocks; only the last block may be shorter.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Lifecycle of one piece. Transitions are monotonic except that a failed
/// in-flight piece returns to `Missing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    Missing,
    InFlight { worker: usize },
    Verified,
}

/// Number of blocks covering a piece of `piece_len` bytes.
pub fn num_blocks(piece_len: u64) -> u32 {
    piece_len.div_ceil(u64::from(BLOCK_SIZE)) as u32
}

/// Length of block `block_index` within a piece of `piece_len` bytes.
pub fn block_length(piece_len: u64, block_index: u32) -> u32 {
    let start = u64::from(block_index) * u64::from(BLOCK_SIZE);
    u64::min(u64::from(BLOCK_SIZE), piece_len - start) as u32
}

/// Assembly buffer for one in-flight piece.
///
/// Blocks may land in any order; each deposit is validated against the
/// block grid before it is accepted.
#[derive(Debug)]
pub struct PieceBuffer {
    index: u32,
    length: u64,
    buf: BytesMut,
    received: Vec<bool>,
    received_count: u32,
}

impl PieceBuffer {
    pub fn new(index: u32, length: u64) -> Self {
        let blocks = num_blocks(length);
        Self {
            index,
            length,
            buf: BytesMut::zeroed(length as usize),
            received: vec![false; blocks as usize],
            received_count: 0,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn num_blocks(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn block_length(&self, block_index: u32) -> u32 {
        block_length(self.length, block_index)
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.num_blocks()
    }

    /// Whether block `block_index` has been deposited yet.
    pub fn has_block(&self, block_index: u32) -> bool {
        self.received
            .get(block_index as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Deposits a block at `begin`.
    ///
    /// The offset must sit on the block grid and the block must have exactly
    /// the expected length; anything else is answering a request we never
    /// made.
    pub fn accept(&mut self, begin: u32, block: &[u8]) -> PeerResult<()> {
        let unrequested = PeerError::UnrequestedBlock {
            index: self.index,
            begin,
        };
        if begin % BLOCK_SIZE != 0 {
            return Err(unrequested);
        }
        let block_index = begin / BLOCK_SIZE;
        if block_index >= self.num_blocks()
            || block.len() as u32 != self.block_length(block_index)
        {
            return Err(unrequested);
        }

        if !self.received[block_index as usize] {
            self.buf[begin as usize..begin as usize + block.len()].copy_from_slice(block);
            self.received[block_index as usize] = true;
            self.received_count += 1;
        }
        Ok(())
    }

    /// Hashes the assembled piece against the manifest entry.
    ///
    /// On success the buffer is handed back for writing; on mismatch the
    /// bytes are discarded.
    pub fn verify(self, expected: &[u8; 20]) -> PeerResult<Bytes> {
        let digest: [u8; 20] = Sha1::digest(&self.buf).into();
        if &digest != expected {
            return Err(PeerError::PieceHashMismatch { index: self.index });
        }
        Ok(self.buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_grid_math() {
        assert_eq!(num_blocks(16384), 1);
        assert_eq!(num_blocks(16385), 2);
        assert_eq!(num_blocks(32768), 2);
        assert_eq!(num_blocks(20000), 2);
        assert_eq!(block_length(20000, 0), 16384);
        assert_eq!(block_length(20000, 1), 3616);
        assert_eq!(block_length(32768, 1), 16384);
    }

    #[test]
    fn accepts_blocks_in_any_order() {
        let mut piece = PieceBuffer::new(0, 20000);
        assert!(!piece.is_complete());
        piece.accept(16384, &[0xbb; 3616]).unwrap();
        assert!(!piece.is_complete());
        piece.accept(0, &[0xaa; 16384]).unwrap();
        assert!(piece.is_complete());
        assert!(piece.has_block(0));
        assert!(piece.has_block(1));
    }

    #[test]
    fn duplicate_blocks_are_idempotent() {
        let mut piece = PieceBuffer::new(0, 16384);
        piece.accept(0, &[1; 16384]).unwrap();
        piece.accept(0, &[2; 16384]).unwrap();
        let data = piece
            .verify(&Sha1::digest([1u8; 16384]).into())
            .unwrap();
        assert_eq!(data[0], 1);
    }

    #[test]
    fn rejects_off_grid_or_wrong_size_blocks() {
        let mut piece = PieceBuffer::new(7, 20000);
        assert!(matches!(
            piece.accept(1, &[0; 16384]),
            Err(PeerError::UnrequestedBlock { index: 7, begin: 1 })
        ));
        assert!(matches!(
            piece.accept(32768, &[0; 100]),
            Err(PeerError::UnrequestedBlock { .. })
        ));
        assert!(matches!(
            piece.accept(16384, &[0; 16384]),
            Err(PeerError::UnrequestedBlock { .. })
        ));
    }

    #[test]
    fn verify_detects_corruption() {
        let mut piece = PieceBuffer::new(3, 100);
        piece.accept(0, &[0xcc; 100]).unwrap();
        let wrong = [0u8; 20];
        assert!(matches!(
            piece.verify(&wrong),
            Err(PeerError::PieceHashMismatch { index: 3 })
        ));
    }

    #[test]
    fn verify_returns_assembled_bytes() {
        let mut piece = PieceBuffer::new(0, 20000);
        let mut data = vec![0u8; 20000];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        piece.accept(0, &data[..16384]).unwrap();
        piece.accept(16384, &data[16384..]).unwrap();
        let expected: [u8; 20] = Sha1::digest(&data).into();
        assert_eq!(piece.verify(&expected).unwrap(), data);
    }
}
