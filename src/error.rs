//! Top-level error taxonomy.
//!
//! Module-local errors (`BencodeError`, `TorrentError`, `TrackerError`,
//! `PeerError`, `StorageError`) are grouped into the categories a run can
//! terminate with. Peer-level trouble is normally contained (the peer is
//! dropped and its piece requeued), so only startup failures, pool
//! exhaustion, and shutdown surface here.
use thiserror::Error;

use crate::peer::PeerError;
use crate::storage::StorageError;
use crate::torrent::TorrentError;
use crate::tracker::TrackerError;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed metainfo, missing fields, unsafe path components.
    #[error("input error: {0}")]
    Input(#[from] TorrentError),

    /// DNS/connect/read/write failures and timeouts, or a swarm with no
    /// usable peers left.
    #[error("network error: {0}")]
    Network(String),

    /// Wire-protocol violations that escalated past a single peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Announce failures: HTTP non-200, `failure reason`, unparsable body.
    #[error("tracker error: {0}")]
    Tracker(#[from] TrackerError),

    /// Output directory and file creation, preallocation, short writes.
    #[error("I/O error: {0}")]
    Io(#[from] StorageError),

    /// External shutdown request.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Stable category name for the single-line stderr surface.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Input(_) => "input",
            Error::Network(_) => "network",
            Error::Protocol(_) => "protocol",
            Error::Tracker(_) => "tracker",
            Error::Io(_) => "io",
            Error::Cancelled => "cancelled",
        }
    }

    /// Process exit status for this category; success is 0.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Input(_) => 2,
            Error::Network(_) => 3,
            Error::Protocol(_) => 4,
            Error::Tracker(_) => 5,
            Error::Io(_) => 6,
            Error::Cancelled => 130,
        }
    }
}

impl From<PeerError> for Error {
    fn from(err: PeerError) -> Self {
        if err.is_network() {
            Error::Network(err.to_string())
        } else {
            Error::Protocol(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_map_to_distinct_exit_codes() {
        let errors = [
            Error::Network("down".to_string()),
            Error::Protocol("bad frame".to_string()),
            Error::Cancelled,
        ];
        let mut codes: Vec<i32> = errors.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        for error in &errors {
            assert_ne!(error.exit_code(), 0);
        }
    }

    #[test]
    fn peer_errors_split_into_network_and_protocol() {
        let timeout = Error::from(PeerError::Timeout("read".to_string()));
        assert_eq!(timeout.category(), "network");
        let bad = Error::from(PeerError::InfoHashMismatch);
        assert_eq!(bad.category(), "protocol");
    }
}
