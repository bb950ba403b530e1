//! Per-peer download task.
//!
//! Each worker owns one peer session and repeatedly claims a piece from the
//! shared scheduler, pipelines block requests for it, verifies the result,
//! and writes it through the sink.
use super::piece::{PieceBuffer, BLOCK_SIZE};
use super::scheduler::{NextAction, PieceScheduler};
use crate::peer::{Message, PeerError, PeerResult, PeerSession};
use crate::storage::{FileSink, StorageError};
use crate::torrent::Metainfo;
use crate::tracker::PeerAddr;

use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Outstanding REQUESTs kept in flight within one piece.
pub const PIPELINE_WINDOW: usize = 5;

/// Worker failures. Peer trouble is contained by the orchestrator (the peer
/// is dropped); storage trouble is fatal to the run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

enum PieceOutcome {
    Verified,
    /// The peer choked us mid-piece; the piece goes back to the pool and
    /// the peer is unusable until it unchokes.
    Choked,
}

#[derive(Debug)]
pub struct PeerWorker {
    id: usize,
    metainfo: Arc<Metainfo>,
    scheduler: Arc<Mutex<PieceScheduler>>,
    sink: Arc<FileSink>,
}

impl PeerWorker {
    pub fn new(
        id: usize,
        metainfo: Arc<Metainfo>,
        scheduler: Arc<Mutex<PieceScheduler>>,
        sink: Arc<FileSink>,
    ) -> Self {
        Self {
            id,
            metainfo,
            scheduler,
            sink,
        }
    }

    fn sched(&self) -> MutexGuard<'_, PieceScheduler> {
        self.scheduler.lock().expect("scheduler lock poisoned")
    }

    /// Drives one peer until the torrent completes, the peer has nothing
    /// more to offer, or the session fails.
    #[instrument(level = "debug", skip(self, peer_id), fields(worker = self.id, peer = %peer))]
    pub async fn run(self, peer: PeerAddr, peer_id: [u8; 20]) -> Result<(), WorkerError> {
        let mut session = PeerSession::connect(
            &peer,
            self.metainfo.info_hash,
            peer_id,
            self.metainfo.num_pieces(),
        )
        .await?;
        debug!(remote_id = %String::from_utf8_lossy(&session.remote_peer_id), "Peer connected");

        loop {
            if self.sched().is_complete() {
                self.finish(&mut session).await;
                return Ok(());
            }

            if session.am_choked {
                if !session.am_interested {
                    session.send(&Message::Interested).await?;
                }
                self.recv_tracked(&mut session).await?;
                continue;
            }

            let action = self.sched().next_action(self.id, &session.bitfield);
            match action {
                NextAction::AllVerified => {
                    self.finish(&mut session).await;
                    return Ok(());
                }
                NextAction::WaitForHave => {
                    self.recv_tracked(&mut session).await?;
                }
                NextAction::Download(index) => {
                    match self.download_piece(&mut session, index).await {
                        Ok(PieceOutcome::Verified) => {}
                        Ok(PieceOutcome::Choked) => {
                            self.sched().release(index);
                        }
                        Err(WorkerError::Peer(PeerError::PieceHashMismatch { .. })) => {
                            let banned = {
                                let mut sched = self.sched();
                                sched.release(index);
                                sched.record_mismatch(session.addr)
                            };
                            if banned {
                                return Err(PeerError::PieceHashMismatch { index }.into());
                            }
                        }
                        Err(err) => {
                            self.sched().release(index);
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Best-effort goodbye once nothing more is wanted from this peer.
    async fn finish(&self, session: &mut PeerSession) {
        if session.am_interested {
            let _ = session.send(&Message::NotInterested).await;
        }
    }

    /// Receives one message, folding HAVE/BITFIELD availability into the
    /// scheduler's rarity table.
    async fn recv_tracked(&self, session: &mut PeerSession) -> PeerResult<Message> {
        let message = session.recv().await?;
        match &message {
            Message::Have(index) => self.sched().record_have(*index),
            Message::Bitfield(_) => self.sched().record_bitfield(&session.bitfield),
            _ => {}
        }
        Ok(message)
    }

    /// Runs the block pipeline for one piece: keep up to `PIPELINE_WINDOW`
    /// REQUESTs outstanding, deposit PIECE blocks as they arrive (in any
    /// order), then verify and persist.
    async fn download_piece(
        &self,
        session: &mut PeerSession,
        index: u32,
    ) -> Result<PieceOutcome, WorkerError> {
        let piece_len = self.sched().piece_size(index);
        let mut buffer = PieceBuffer::new(index, piece_len);
        let mut next_block: u32 = 0;
        let mut outstanding: Vec<(u32, u32)> = Vec::new();

        while !buffer.is_complete() {
            while outstanding.len() < PIPELINE_WINDOW && next_block < buffer.num_blocks() {
                let begin = next_block * BLOCK_SIZE;
                let length = buffer.block_length(next_block);
                session
                    .send(&Message::Request {
                        index,
                        begin,
                        length,
                    })
                    .await?;
                outstanding.push((begin, length));
                next_block += 1;
            }

            match self.recv_tracked(session).await? {
                Message::Piece {
                    index: piece_index,
                    begin,
                    block,
                } => {
                    if piece_index != index {
                        return Err(PeerError::UnrequestedBlock {
                            index: piece_index,
                            begin,
                        }
                        .into());
                    }
                    let slot = outstanding
                        .iter()
                        .position(|&(b, l)| b == begin && l == block.len() as u32)
                        .ok_or(PeerError::UnrequestedBlock { index, begin })?;
                    outstanding.swap_remove(slot);
                    buffer.accept(begin, &block)?;
                }
                Message::Choke => return Ok(PieceOutcome::Choked),
                // Keep-alives, repeated unchokes, and already-tracked HAVEs.
                _ => {}
            }
        }

        let data = buffer.verify(&self.metainfo.piece_hashes[index as usize])?;
        let offset = u64::from(index) * self.metainfo.piece_length;
        self.sink.write_at(offset, &data)?;
        let done = self.sched().mark_verified(index);
        info!(index, "Piece verified and written");
        if done {
            info!("All pieces verified");
        }
        Ok(PieceOutcome::Verified)
    }
}
