//! Download orchestration: tracker announce, peer pool, piece scheduling.
use crate::error::{Error, Result};
use crate::storage::FileSink;
use crate::torrent::Metainfo;
use crate::tracker::{self, Event, PeerAddr};

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

pub mod piece;
pub mod scheduler;
pub mod worker;

pub use piece::{PieceBuffer, PieceStatus, BLOCK_SIZE};
pub use scheduler::{NextAction, PieceScheduler};
pub use worker::{PeerWorker, WorkerError, PIPELINE_WINDOW};

/// Announce rounds before giving up on a swarm that cannot complete the
/// torrent.
const MAX_ANNOUNCE_ATTEMPTS: u32 = 3;

/// Cap on how long to honour the tracker interval between re-announces.
const MAX_REANNOUNCE_WAIT: Duration = Duration::from_secs(30);

/// Budget for the best-effort `stopped` announce during shutdown.
const STOPPED_ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables for one download run.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub output_dir: PathBuf,
    pub port: u16,
    pub peer_id: Option<[u8; 20]>,
    pub numwant: Option<u32>,
    pub max_peers: usize,
}

impl DownloadOptions {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            port: 6881,
            peer_id: None,
            numwant: None,
            max_peers: 30,
        }
    }
}

/// Composes tracker, peer pool, scheduler, and sink into one run.
#[derive(Debug)]
pub struct Downloader {
    metainfo: Arc<Metainfo>,
    options: DownloadOptions,
}

fn lock(scheduler: &Arc<Mutex<PieceScheduler>>) -> MutexGuard<'_, PieceScheduler> {
    scheduler.lock().expect("scheduler lock poisoned")
}

impl Downloader {
    pub fn new(metainfo: Metainfo, options: DownloadOptions) -> Self {
        Self {
            metainfo: Arc::new(metainfo),
            options,
        }
    }

    /// Runs the download to completion or until `shutdown` resolves.
    ///
    /// On shutdown every peer socket is closed (tasks are aborted and their
    /// in-flight buffers dropped), a best-effort `stopped` event goes to the
    /// tracker, and whatever was already written stays on disk.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let sink = Arc::new(FileSink::create(&self.options.output_dir, &self.metainfo)?);
        let scheduler = Arc::new(Mutex::new(PieceScheduler::new(&self.metainfo)));
        let tracker = tracker::Client::new(self.options.port, self.options.peer_id)?;

        tokio::pin!(shutdown);
        let result = tokio::select! {
            _ = &mut shutdown => {
                warn!("Shutdown requested, closing peer connections");
                Err(Error::Cancelled)
            }
            result = self.drive(&tracker, &scheduler, &sink) => result,
        };

        if matches!(result, Err(Error::Cancelled)) {
            let left = lock(&scheduler).bytes_left();
            let stopped = tracker.announce(
                &self.metainfo,
                left,
                Some(Event::Stopped),
                Some(0),
                None,
            );
            match tokio::time::timeout(STOPPED_ANNOUNCE_TIMEOUT, stopped).await {
                Ok(Err(err)) => warn!(error = %err, "Stopped announce failed"),
                Err(_) => warn!("Stopped announce timed out"),
                Ok(Ok(_)) => {}
            }
        }
        result
    }

    #[instrument(level = "info", skip_all, fields(name = %self.metainfo.name))]
    async fn drive(
        &self,
        tracker: &tracker::Client,
        scheduler: &Arc<Mutex<PieceScheduler>>,
        sink: &Arc<FileSink>,
    ) -> Result<()> {
        info!(
            info_hash = %self.metainfo.info_hash,
            pieces = self.metainfo.num_pieces(),
            total = self.metainfo.total_length,
            "Starting download"
        );

        let mut event = Some(Event::Started);
        let mut tracker_id: Option<String> = None;
        for attempt in 1..=MAX_ANNOUNCE_ATTEMPTS {
            let left = lock(scheduler).bytes_left();
            let response = tracker
                .announce(
                    &self.metainfo,
                    left,
                    event.take(),
                    self.options.numwant,
                    tracker_id.clone(),
                )
                .await?;
            if response.tracker_id.is_some() {
                tracker_id = response.tracker_id.clone();
            }
            info!(
                peers = response.peers.len(),
                interval = response.interval,
                "Tracker announce complete"
            );

            self.run_swarm(&response.peers, scheduler, sink, tracker.peer_id())
                .await?;

            if lock(scheduler).is_complete() {
                // Best-effort completion announce; the download already
                // succeeded on disk.
                if let Err(err) = tracker
                    .announce(
                        &self.metainfo,
                        0,
                        Some(Event::Completed),
                        Some(0),
                        tracker_id.clone(),
                    )
                    .await
                {
                    warn!(error = %err, "Completion announce failed");
                }
                info!("Download complete");
                return Ok(());
            }

            if attempt < MAX_ANNOUNCE_ATTEMPTS {
                let wait =
                    Duration::from_secs(response.interval).min(MAX_REANNOUNCE_WAIT);
                warn!(
                    attempt,
                    verified = lock(scheduler).verified_pieces(),
                    "Peer pool exhausted with pieces missing, re-announcing"
                );
                tokio::time::sleep(wait).await;
            }
        }
        Err(Error::Network(
            "no reachable peer could supply the remaining pieces".to_string(),
        ))
    }

    /// Spawns one task per usable peer and drains them. Peer-level failures
    /// are contained; storage failures abort the run.
    async fn run_swarm(
        &self,
        peers: &[PeerAddr],
        scheduler: &Arc<Mutex<PieceScheduler>>,
        sink: &Arc<FileSink>,
        peer_id: [u8; 20],
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut seen: HashSet<SocketAddr> = HashSet::new();
        for (id, peer) in peers.iter().enumerate() {
            if tasks.len() >= self.options.max_peers {
                break;
            }
            let addr = SocketAddr::new(peer.ip, peer.port);
            if !seen.insert(addr) || lock(scheduler).is_banned(&addr) {
                continue;
            }
            let worker = PeerWorker::new(
                id,
                Arc::clone(&self.metainfo),
                Arc::clone(scheduler),
                Arc::clone(sink),
            );
            tasks.spawn(worker.run(peer.clone(), peer_id));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(WorkerError::Storage(err))) => {
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    return Err(Error::Io(err));
                }
                Ok(Err(WorkerError::Peer(err))) => {
                    warn!(error = %err, "Peer session ended");
                }
                Err(join_err) if join_err.is_cancelled() => {}
                Err(join_err) => {
                    warn!(error = %join_err, "Peer task failed");
                }
            }
            if lock(scheduler).is_complete() {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
        }
        Ok(())
    }
}
