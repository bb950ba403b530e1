//! Piece-availability bitfield, MSB-first per byte.
use super::{PeerError, PeerResult};

/// Bit array over `num_pieces` pieces; bit 7 of byte 0 is piece 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bytes: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    /// An all-zero bitfield. This is a session's starting state when the
    /// peer never sends a BITFIELD and relies on HAVE messages instead.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Validates a received BITFIELD payload.
    ///
    /// The payload must be exactly `ceil(num_pieces / 8)` bytes and every
    /// padding bit past the last piece must be zero.
    pub fn from_payload(payload: &[u8], num_pieces: usize) -> PeerResult<Self> {
        let want = num_pieces.div_ceil(8);
        if payload.len() != want {
            return Err(PeerError::BitfieldLength {
                got: payload.len(),
                want,
            });
        }
        let spare_bits = want * 8 - num_pieces;
        if spare_bits > 0 {
            let last = payload[want - 1];
            let mask = (1u8 << spare_bits) - 1;
            if last & mask != 0 {
                return Err(PeerError::BitfieldSpareBits);
            }
        }
        Ok(Self {
            bytes: payload.to_vec(),
            num_pieces,
        })
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let mask = 1u8 << (7 - index % 8);
        self.bytes[index / 8] & mask != 0
    }

    pub fn set(&mut self, index: usize) {
        if index < self.num_pieces {
            let mask = 1u8 << (7 - index % 8);
            self.bytes[index / 8] |= mask;
        }
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.num_pieces == 0
    }

    /// Number of pieces this bitfield claims.
    pub fn count(&self) -> usize {
        (0..self.num_pieces).filter(|&i| self.has(i)).count()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}
