//! Shared piece state for a download run.
//!
//! One `PieceScheduler` lives behind a mutex for the whole run. Peer workers
//! claim pieces from it, report completions and failures into it, and it
//! tracks per-peer suspicion for hash mismatches.
use super::piece::PieceStatus;
use crate::peer::Bitfield;
use crate::torrent::Metainfo;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Hash mismatches tolerated from one peer before it is banned for the run.
pub const MAX_HASH_MISMATCHES: u32 = 3;

/// What a worker should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Download this piece; it is now in flight under the caller.
    Download(u32),
    /// Nothing claimable from this peer right now; absorb messages and retry
    /// (a HAVE may change the answer).
    WaitForHave,
    /// Every piece is verified.
    AllVerified,
}

#[derive(Debug)]
pub struct PieceScheduler {
    piece_length: u64,
    total_length: u64,
    states: Vec<PieceStatus>,
    /// How many connected peers advertise each piece; drives rarest-first
    /// selection.
    availability: Vec<u32>,
    verified: usize,
    suspicion: HashMap<SocketAddr, u32>,
    banned: HashSet<SocketAddr>,
}

impl PieceScheduler {
    pub fn new(metainfo: &Metainfo) -> Self {
        let num_pieces = metainfo.num_pieces();
        Self {
            piece_length: metainfo.piece_length,
            total_length: metainfo.total_length,
            states: vec![PieceStatus::Missing; num_pieces],
            availability: vec![0; num_pieces],
            verified: 0,
            suspicion: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.states.len()
    }

    /// Effective length of piece `index`; the last piece covers whatever the
    /// total leaves over, or a full piece when the total is aligned.
    pub fn piece_size(&self, index: u32) -> u64 {
        let index = index as usize;
        if index + 1 < self.num_pieces() {
            self.piece_length
        } else {
            self.total_length - (self.num_pieces() as u64 - 1) * self.piece_length
        }
    }

    /// Counts a freshly received bitfield into the availability table.
    pub fn record_bitfield(&mut self, bitfield: &Bitfield) {
        for index in 0..self.availability.len().min(bitfield.len()) {
            if bitfield.has(index) {
                self.availability[index] += 1;
            }
        }
    }

    pub fn record_have(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// Picks the rarest missing piece the peer can serve and marks it in
    /// flight, or says why nothing was claimed.
    pub fn next_action(&mut self, worker: usize, bitfield: &Bitfield) -> NextAction {
        if self.is_complete() {
            return NextAction::AllVerified;
        }

        let candidate = self
            .states
            .iter()
            .enumerate()
            .filter(|(index, state)| {
                **state == PieceStatus::Missing && bitfield.has(*index)
            })
            .min_by_key(|(index, _)| (self.availability[*index], *index))
            .map(|(index, _)| index as u32);

        match candidate {
            Some(index) => {
                self.states[index as usize] = PieceStatus::InFlight { worker };
                debug!(index, worker, "Piece claimed");
                NextAction::Download(index)
            }
            None => NextAction::WaitForHave,
        }
    }

    /// Returns an in-flight piece to `Missing` (choke, disconnect, or a
    /// failed verification).
    pub fn release(&mut self, index: u32) {
        let state = &mut self.states[index as usize];
        if matches!(state, PieceStatus::InFlight { .. }) {
            *state = PieceStatus::Missing;
        }
    }

    /// Marks a piece verified. The caller must have written the bytes to the
    /// sink already. Returns true when this was the last piece.
    pub fn mark_verified(&mut self, index: u32) -> bool {
        let state = &mut self.states[index as usize];
        if *state != PieceStatus::Verified {
            *state = PieceStatus::Verified;
            self.verified += 1;
        }
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        self.verified == self.states.len()
    }

    pub fn verified_pieces(&self) -> usize {
        self.verified
    }

    /// Bytes still missing, for announce `left` bookkeeping.
    pub fn bytes_left(&self) -> u64 {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != PieceStatus::Verified)
            .map(|(index, _)| self.piece_size(index as u32))
            .sum()
    }

    /// Bumps a peer's suspicion counter after a hash mismatch; returns true
    /// once the peer crosses the ban threshold.
    pub fn record_mismatch(&mut self, addr: SocketAddr) -> bool {
        let count = self.suspicion.entry(addr).or_insert(0);
        *count += 1;
        warn!(peer = %addr, mismatches = *count, "Piece failed verification");
        if *count >= MAX_HASH_MISMATCHES {
            self.banned.insert(addr);
            warn!(peer = %addr, "Peer banned for this run");
            true
        } else {
            false
        }
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned.contains(addr)
    }
}
