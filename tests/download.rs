//! End-to-end downloads against a scripted peer and tracker.
use grabbit::download::{DownloadOptions, Downloader};
use grabbit::peer::{Handshake, Message};
use grabbit::torrent::{InfoHash, Metainfo};
use grabbit::Error;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const PIECE_LEN: usize = 32768;

/// Deterministic payload: two full pieces plus a 20000-byte tail.
fn payload() -> Vec<u8> {
    (0..PIECE_LEN * 2 + 20000)
        .map(|i| ((i * 31 + 7) % 256) as u8)
        .collect()
}

fn piece_hashes(payload: &[u8]) -> Vec<u8> {
    let mut hashes = Vec::new();
    for chunk in payload.chunks(PIECE_LEN) {
        hashes.extend_from_slice(&Sha1::digest(chunk));
    }
    hashes
}

/// Bencoded single-file info dictionary for `payload`.
fn single_file_info(payload: &[u8], name: &str) -> Vec<u8> {
    let hashes = piece_hashes(payload);
    let mut info = format!(
        "d6:lengthi{}e4:name{}:{}12:piece lengthi{}e6:pieces{}:",
        payload.len(),
        name.len(),
        name,
        PIECE_LEN,
        hashes.len()
    )
    .into_bytes();
    info.extend_from_slice(&hashes);
    info.push(b'e');
    info
}

/// Bencoded two-file info dictionary splitting `payload` after `split`.
fn multi_file_info(payload: &[u8], name: &str, split: usize) -> Vec<u8> {
    let hashes = piece_hashes(payload);
    let mut info = format!(
        "d5:filesld6:lengthi{}e4:pathl5:a.bineed6:lengthi{}e4:pathl3:sub5:b.bineee\
4:name{}:{}12:piece lengthi{}e6:pieces{}:",
        split,
        payload.len() - split,
        name.len(),
        name,
        PIECE_LEN,
        hashes.len()
    )
    .into_bytes();
    info.extend_from_slice(&hashes);
    info.push(b'e');
    info
}

fn metainfo_bytes(announce: &str, info: &[u8]) -> Vec<u8> {
    let mut bytes = format!("d8:announce{}:{}4:info", announce.len(), announce).into_bytes();
    bytes.extend_from_slice(info);
    bytes.push(b'e');
    bytes
}

/// A peer that unchokes on INTERESTED, advertises every piece, and answers
/// each REQUEST with the matching block (optionally corrupted).
async fn spawn_seed_peer(payload: Arc<Vec<u8>>, info_hash: InfoHash, corrupt: bool) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve_peer_conn(
                stream,
                Arc::clone(&payload),
                info_hash,
                corrupt,
            ));
        }
    });
    port
}

async fn serve_peer_conn(
    mut stream: TcpStream,
    payload: Arc<Vec<u8>>,
    info_hash: InfoHash,
    corrupt: bool,
) {
    let mut handshake = [0u8; 68];
    if stream.read_exact(&mut handshake).await.is_err() {
        return;
    }
    let reply = Handshake::new(info_hash, *b"-MK0001-000000000000");
    if stream.write_all(&reply.serialize()).await.is_err() {
        return;
    }

    let num_pieces = payload.len().div_ceil(PIECE_LEN);
    let mut bits = vec![0u8; num_pieces.div_ceil(8)];
    for i in 0..num_pieces {
        bits[i / 8] |= 1 << (7 - i % 8);
    }
    if stream
        .write_all(&Message::Bitfield(Bytes::from(bits)).to_bytes())
        .await
        .is_err()
    {
        return;
    }

    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        match Message::parse(&body) {
            Ok(Message::Interested) => {
                if stream
                    .write_all(&Message::Unchoke.to_bytes())
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Message::Request {
                index,
                begin,
                length,
            }) => {
                let start = index as usize * PIECE_LEN + begin as usize;
                let mut block = payload[start..start + length as usize].to_vec();
                if corrupt {
                    block[0] ^= 0xff;
                }
                let piece = Message::Piece {
                    index,
                    begin,
                    block: Bytes::from(block),
                };
                if stream.write_all(&piece.to_bytes()).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

/// A one-endpoint HTTP tracker that answers every announce with the same
/// bencoded compact-peers body.
async fn spawn_tracker(peer_port: u16, interval: u64) -> u16 {
    let mut body = format!("d8:intervali{interval}e5:peers6:").into_bytes();
    body.extend_from_slice(&[127, 0, 0, 1]);
    body.extend_from_slice(&peer_port.to_be_bytes());
    body.push(b'e');

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    request.extend_from_slice(&buf[..n]);
                    if request.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                assert!(request.starts_with(b"GET "));
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&body).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn downloads_three_piece_torrent_end_to_end() {
    let payload = Arc::new(payload());
    let info = single_file_info(&payload, "data.bin");
    let info_hash = InfoHash(Sha1::digest(&info).into());

    let peer_port = spawn_seed_peer(Arc::clone(&payload), info_hash, false).await;
    let tracker_port = spawn_tracker(peer_port, 1800).await;

    let announce = format!("http://127.0.0.1:{tracker_port}/announce");
    let metainfo = Metainfo::parse(&metainfo_bytes(&announce, &info)).unwrap();
    assert_eq!(metainfo.info_hash, info_hash);
    assert_eq!(metainfo.num_pieces(), 3);
    assert_eq!(metainfo.piece_size(2), 20000);

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let downloader = Downloader::new(metainfo, DownloadOptions::new(out.clone()));
    downloader.run(std::future::pending()).await.unwrap();

    let written = std::fs::read(out.join("data.bin")).unwrap();
    assert_eq!(written, *payload);
}

#[tokio::test]
async fn downloads_multi_file_torrent_end_to_end() {
    let payload = Arc::new(payload());
    // Split mid-piece so at least one piece spans both files.
    let split = PIECE_LEN + 1000;
    let info = multi_file_info(&payload, "bundle", split);
    let info_hash = InfoHash(Sha1::digest(&info).into());

    let peer_port = spawn_seed_peer(Arc::clone(&payload), info_hash, false).await;
    let tracker_port = spawn_tracker(peer_port, 1800).await;

    let announce = format!("http://127.0.0.1:{tracker_port}/announce");
    let metainfo = Metainfo::parse(&metainfo_bytes(&announce, &info)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let downloader = Downloader::new(metainfo, DownloadOptions::new(out.clone()));
    downloader.run(std::future::pending()).await.unwrap();

    let a = std::fs::read(out.join("bundle/a.bin")).unwrap();
    let b = std::fs::read(out.join("bundle/sub/b.bin")).unwrap();
    assert_eq!(a, payload[..split]);
    assert_eq!(b, payload[split..]);
}

#[tokio::test]
async fn corrupting_peer_is_banned_and_run_fails() {
    let payload = Arc::new(payload());
    let info = single_file_info(&payload, "data.bin");
    let info_hash = InfoHash(Sha1::digest(&info).into());

    let peer_port = spawn_seed_peer(Arc::clone(&payload), info_hash, true).await;
    // Zero interval keeps the re-announce rounds fast.
    let tracker_port = spawn_tracker(peer_port, 0).await;

    let announce = format!("http://127.0.0.1:{tracker_port}/announce");
    let metainfo = Metainfo::parse(&metainfo_bytes(&announce, &info)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let downloader = Downloader::new(metainfo, DownloadOptions::new(out.clone()));
    let err = downloader.run(std::future::pending()).await.unwrap_err();
    assert!(matches!(err, Error::Network(_)));

    // Nothing corrupt was ever committed as verified data.
    let written = std::fs::read(out.join("data.bin")).unwrap();
    assert_ne!(written, *payload);
}
