//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation and URL encoding helpers
//!
//! Used by the client to discover peers for a torrent.
use crate::torrent::{InfoHash, Metainfo};

pub mod announce_url;

pub use announce_url::{AnnounceUrl, Scheme};

use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Announce request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Announce URL is invalid: {0}")]
    InvalidAnnounceUrl(#[from] url::ParseError),

    #[error("Announce scheme {0:?} is not supported")]
    UnsupportedScheme(String),

    #[error("Announce URL {0:?} has no host")]
    MissingHost(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracker answered with HTTP status {0}")]
    HttpStatus(u16),

    #[error("Tracker refused the announce: {0}")]
    Failure(String),

    #[error("Tracker response could not be decoded: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Tracker response is invalid: {0}")]
    InvalidResponse(String),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// Optional announce event, serialized as the BEP 3 literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
            Event::Completed => "completed",
            Event::Stopped => "stopped",
        }
    }
}

/// Contains the parameters for a tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub compact: bool,
    pub event: Option<Event>,
    pub numwant: Option<u32>,
    pub key: Option<String>,
    pub tracker_id: Option<String>,
}

/// A peer as advertised by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    pub ip: IpAddr,
    pub port: u16,
    /// Present only in the non-compact response form. The handshake-received
    /// id wins over this one.
    pub advertised_peer_id: Option<[u8; 20]>,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Contains the parsed response from a tracker.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: u64,
    pub min_interval: Option<u64>,
    pub tracker_id: Option<String>,
    pub complete: Option<i64>,
    pub incomplete: Option<i64>,
    pub peers: Vec<PeerAddr>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
    #[serde(rename = "warning message", default)]
    warning_message: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<i64>,
    #[serde(rename = "tracker id", default)]
    tracker_id: Option<String>,
    #[serde(default)]
    complete: Option<i64>,
    #[serde(default)]
    incomplete: Option<i64>,
    #[serde(default)]
    peers: Option<RawPeers>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(serde_bytes::ByteBuf),
    NonCompact(Vec<RawPeerDict>),
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    #[serde(rename = "peer id", default)]
    peer_id: Option<serde_bytes::ByteBuf>,
    ip: RawIp,
    port: u16,
}

/// The `ip` key is a dotted-quad string in the wild, but an integer form
/// exists too; both are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawIp {
    Text(String),
    Numeric(i64),
}

/// Represents a client communicating with a bittorrent tracker.
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
    /// Opaque per-run key so the tracker can correlate announces across
    /// address changes.
    key: String,
}

impl Client {
    pub fn new(port: u16, peer_id: Option<[u8; 20]>) -> TrackerResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("*/*"),
        );
        let http = reqwest::Client::builder()
            .user_agent(concat!("grabbit/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(HTTP_TIMEOUT)
            .build()?;
        let mut key = [0u8; 4];
        rand::rng().fill(&mut key);
        Ok(Self {
            http,
            peer_id: peer_id.unwrap_or_else(generate_peer_id),
            port,
            key: hex::encode(key),
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends an announce request to the tracker to get a list of peers.
    ///
    /// `left` is the number of bytes still missing; `event` marks the start
    /// and end of the run; `tracker_id` echoes the id the tracker returned
    /// on an earlier announce.
    #[tracing::instrument(skip(self, torrent), level = "debug", fields(announce = %torrent.announce))]
    pub async fn announce(
        &self,
        torrent: &Metainfo,
        left: u64,
        event: Option<Event>,
        numwant: Option<u32>,
        tracker_id: Option<String>,
    ) -> TrackerResult<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: torrent.total_length - left,
            left,
            compact: true,
            event,
            numwant,
            key: Some(self.key.clone()),
            tracker_id,
        };

        let announce_url = AnnounceUrl::parse(&torrent.announce)?;
        announce_url.require_http()?;
        let url = announce_url.with_query(&build_query(&request));
        debug!(%url, "Making announce request to tracker");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(TrackerError::HttpStatus(status.as_u16()));
        }
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

/// Assembles the announce query string by hand.
///
/// The info-hash and peer-id are raw 20-byte values; they must be
/// percent-encoded exactly once, which rules out generic query builders
/// that would re-encode the `%` escapes.
fn build_query(request: &AnnounceRequest) -> String {
    let mut query = String::with_capacity(256);
    query.push_str("info_hash=");
    query.push_str(&url_encode(request.info_hash.as_bytes()));
    query.push_str("&peer_id=");
    query.push_str(&url_encode(&request.peer_id));
    query.push_str(&format!("&port={}", request.port));
    query.push_str(&format!("&uploaded={}", request.uploaded));
    query.push_str(&format!("&downloaded={}", request.downloaded));
    query.push_str(&format!("&left={}", request.left));
    if request.compact {
        query.push_str("&compact=1");
    }
    if let Some(event) = request.event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    if let Some(numwant) = request.numwant {
        query.push_str(&format!("&numwant={numwant}"));
    }
    if let Some(key) = &request.key {
        query.push_str("&key=");
        query.push_str(&url_encode(key.as_bytes()));
    }
    if let Some(tracker_id) = &request.tracker_id {
        query.push_str("&trackerid=");
        query.push_str(&url_encode(tracker_id.as_bytes()));
    }
    query
}

/// Parses the response from a BitTorrent tracker announce request.
///
/// A `failure reason` key makes the whole response an error; nothing else in
/// the document is trusted in that case. Otherwise `interval` is required
/// and `peers` may arrive in either the compact byte-string form (6 bytes
/// per peer) or as a list of dictionaries.
fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
    let raw: RawResponse = serde_bencode::from_bytes(bytes)?;

    if let Some(reason) = raw.failure_reason {
        return Err(TrackerError::Failure(reason));
    }
    if let Some(warning) = &raw.warning_message {
        warn!(%warning, "Tracker sent a warning");
    }

    let interval = raw
        .interval
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| TrackerError::InvalidResponse("missing interval".to_string()))?;

    let peers = match raw.peers {
        Some(RawPeers::Compact(bytes)) => parse_compact_peers(&bytes)?,
        Some(RawPeers::NonCompact(dicts)) => parse_peer_dicts(dicts)?,
        None => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        min_interval: raw.min_interval.and_then(|i| u64::try_from(i).ok()),
        tracker_id: raw.tracker_id,
        complete: raw.complete,
        incomplete: raw.incomplete,
        peers,
    })
}

/// Compact form: each peer is 6 bytes, a network-order IPv4 address
/// followed by a network-order port.
fn parse_compact_peers(bytes: &[u8]) -> TrackerResult<Vec<PeerAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse(format!(
            "compact peers length {} is not a multiple of 6",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| PeerAddr {
            ip: IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
            advertised_peer_id: None,
        })
        .collect())
}

fn parse_peer_dicts(dicts: Vec<RawPeerDict>) -> TrackerResult<Vec<PeerAddr>> {
    dicts
        .into_iter()
        .map(|dict| {
            let ip = match dict.ip {
                RawIp::Text(text) => text.parse::<IpAddr>().map_err(|_| {
                    TrackerError::InvalidResponse(format!("bad peer ip {text:?}"))
                })?,
                RawIp::Numeric(n) => {
                    let n = u32::try_from(n).map_err(|_| {
                        TrackerError::InvalidResponse(format!("bad peer ip {n}"))
                    })?;
                    IpAddr::V4(Ipv4Addr::from(n))
                }
            };
            let advertised_peer_id = match dict.peer_id {
                Some(bytes) => Some(<[u8; 20]>::try_from(bytes.as_slice()).map_err(|_| {
                    TrackerError::InvalidResponse("peer id is not 20 bytes".to_string())
                })?),
                None => None,
            };
            Ok(PeerAddr {
                ip,
                port: dict.port,
                advertised_peer_id,
            })
        })
        .collect()
}

/// Generates a unique peer ID for this client.
///
/// The 20 bytes are the `-GB0001-` client prefix followed by 12 random
/// bytes, following the common azureus-style convention.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-GB0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    let mut rng = rand::rng();
    rng.fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) pass through; every
/// other byte becomes `%XX` with uppercase hex.
pub fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}
