//! A live connection to one remote peer.
use super::message::MAX_FRAME_LEN;
use super::{Bitfield, Handshake, Message, PeerError, PeerResult};
use crate::torrent::InfoHash;
use crate::tracker::PeerAddr;

use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, trace};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer connection after a completed, validated handshake.
///
/// Tracks the four choke/interest flags and the peer's piece bitfield. The
/// flags follow the wire: received CHOKE/UNCHOKE drive `am_choked`, sent
/// INTERESTED/NOT_INTERESTED drive `am_interested`, and so on.
#[derive(Debug)]
pub struct PeerSession {
    pub addr: SocketAddr,
    stream: TcpStream,
    pub remote_peer_id: [u8; 20],
    pub bitfield: Bitfield,
    pub am_choked: bool,
    pub am_interested: bool,
    pub peer_choked: bool,
    pub peer_interested: bool,
    /// False until the first framed message; BITFIELD is only legal then.
    started: bool,
}

impl PeerSession {
    /// Connects to `peer` and performs the handshake exchange.
    ///
    /// Our handshake is sent immediately after the TCP connect; the peer's
    /// is then read and validated. An info-hash mismatch drops the
    /// connection. If the tracker advertised a peer id and the handshake
    /// carries a different one, the handshake id wins.
    #[instrument(level = "debug", skip(info_hash, peer_id), fields(peer = %peer))]
    pub async fn connect(
        peer: &PeerAddr,
        info_hash: InfoHash,
        peer_id: [u8; 20],
        num_pieces: usize,
    ) -> PeerResult<Self> {
        let addr = SocketAddr::new(peer.ip, peer.port);
        let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout("connect".to_string()))??;

        let ours = Handshake::new(info_hash, peer_id);
        timeout(IDLE_TIMEOUT, stream.write_all(&ours.serialize()))
            .await
            .map_err(|_| PeerError::Timeout("handshake send".to_string()))??;

        let theirs = timeout(IDLE_TIMEOUT, Handshake::read(&mut stream))
            .await
            .map_err(|_| PeerError::Timeout("handshake recv".to_string()))??;
        theirs.validate(info_hash)?;

        if let Some(advertised) = peer.advertised_peer_id {
            if advertised != theirs.peer_id {
                debug!(peer = %peer, "Handshake peer id differs from tracker-advertised id");
            }
        }

        Ok(Self {
            addr,
            stream,
            remote_peer_id: theirs.peer_id,
            bitfield: Bitfield::new(num_pieces),
            am_choked: true,
            am_interested: false,
            peer_choked: true,
            peer_interested: false,
            started: false,
        })
    }

    /// Sends one framed message, updating our side of the session flags.
    pub async fn send(&mut self, message: &Message) -> PeerResult<()> {
        trace!(id = ?message.id(), peer = %self.addr, "Sending message");
        let bytes = message.to_bytes();
        timeout(IDLE_TIMEOUT, self.stream.write_all(&bytes))
            .await
            .map_err(|_| PeerError::Timeout("send".to_string()))??;
        match message {
            Message::Interested => self.am_interested = true,
            Message::NotInterested => self.am_interested = false,
            Message::Choke => self.peer_choked = true,
            Message::Unchoke => self.peer_choked = false,
            _ => {}
        }
        Ok(())
    }

    /// Receives one framed message, applying its effect on session state
    /// (choke flags, bitfield) before handing it back.
    pub async fn recv(&mut self) -> PeerResult<Message> {
        let mut len_buf = [0u8; 4];
        timeout(IDLE_TIMEOUT, self.stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| PeerError::Timeout("recv".to_string()))??;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(PeerError::FrameTooLarge(len));
        }

        let mut body = vec![0u8; len as usize];
        if len > 0 {
            timeout(IDLE_TIMEOUT, self.stream.read_exact(&mut body))
                .await
                .map_err(|_| PeerError::Timeout("recv".to_string()))??;
        }

        let message = Message::parse(&body)?;
        trace!(id = ?message.id(), peer = %self.addr, "Received message");
        self.apply(&message)?;
        Ok(message)
    }

    fn apply(&mut self, message: &Message) -> PeerResult<()> {
        let first = !self.started;
        self.started = true;
        match message {
            Message::Choke => self.am_choked = true,
            Message::Unchoke => self.am_choked = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => {
                if *index as usize >= self.bitfield.len() {
                    return Err(PeerError::HaveOutOfRange(*index));
                }
                self.bitfield.set(*index as usize);
            }
            Message::Bitfield(payload) => {
                if !first {
                    return Err(PeerError::BitfieldAfterStart);
                }
                self.bitfield = Bitfield::from_payload(payload, self.bitfield.len())?;
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    const INFO_HASH: InfoHash = InfoHash([0x42; 20]);
    const OUR_ID: [u8; 20] = *b"-GB0001-aaaaaaaaaaaa";
    const THEIR_ID: [u8; 20] = *b"-GB0001-bbbbbbbbbbbb";

    /// Accepts one connection and answers the handshake, then hands the
    /// socket to `script` for the rest of the exchange.
    async fn mock_peer<F, Fut>(script: F) -> PeerAddr
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            let theirs = Handshake::parse(&buf).unwrap();
            assert_eq!(theirs.info_hash, INFO_HASH);
            let ours = Handshake::new(INFO_HASH, THEIR_ID);
            stream.write_all(&ours.serialize()).await.unwrap();
            script(stream).await;
        });
        PeerAddr {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            advertised_peer_id: None,
        }
    }

    #[tokio::test]
    async fn connect_records_handshake_peer_id() {
        let peer = mock_peer(|_stream| async {}).await;
        let session = PeerSession::connect(&peer, INFO_HASH, OUR_ID, 8)
            .await
            .unwrap();
        assert_eq!(session.remote_peer_id, THEIR_ID);
        assert!(session.am_choked);
        assert!(!session.am_interested);
    }

    #[tokio::test]
    async fn connect_rejects_info_hash_mismatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 68];
            stream.read_exact(&mut buf).await.unwrap();
            let wrong = Handshake::new(InfoHash([0x43; 20]), THEIR_ID);
            stream.write_all(&wrong.serialize()).await.unwrap();
        });
        let peer = PeerAddr {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            advertised_peer_id: None,
        };
        assert!(matches!(
            PeerSession::connect(&peer, INFO_HASH, OUR_ID, 8).await,
            Err(PeerError::InfoHashMismatch)
        ));
    }

    #[tokio::test]
    async fn bitfield_is_only_legal_first() {
        let peer = mock_peer(|mut stream| async move {
            let bits = Message::Bitfield(bytes::Bytes::from_static(&[0b1010_0000]));
            stream.write_all(&Message::Unchoke.to_bytes()).await.unwrap();
            stream.write_all(&bits.to_bytes()).await.unwrap();
        })
        .await;
        let mut session = PeerSession::connect(&peer, INFO_HASH, OUR_ID, 8)
            .await
            .unwrap();
        assert_eq!(session.recv().await.unwrap(), Message::Unchoke);
        assert!(!session.am_choked);
        assert!(matches!(
            session.recv().await,
            Err(PeerError::BitfieldAfterStart)
        ));
    }

    #[tokio::test]
    async fn bitfield_then_have_updates_availability() {
        let peer = mock_peer(|mut stream| async move {
            let bits = Message::Bitfield(bytes::Bytes::from_static(&[0b1000_0000]));
            stream.write_all(&bits.to_bytes()).await.unwrap();
            stream.write_all(&Message::Have(3).to_bytes()).await.unwrap();
        })
        .await;
        let mut session = PeerSession::connect(&peer, INFO_HASH, OUR_ID, 8)
            .await
            .unwrap();
        session.recv().await.unwrap();
        assert!(session.bitfield.has(0));
        assert!(!session.bitfield.has(3));
        session.recv().await.unwrap();
        assert!(session.bitfield.has(3));
    }

    #[tokio::test]
    async fn have_out_of_range_is_rejected() {
        let peer = mock_peer(|mut stream| async move {
            stream.write_all(&Message::Have(8).to_bytes()).await.unwrap();
        })
        .await;
        let mut session = PeerSession::connect(&peer, INFO_HASH, OUR_ID, 8)
            .await
            .unwrap();
        assert!(matches!(
            session.recv().await,
            Err(PeerError::HaveOutOfRange(8))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let peer = mock_peer(|mut stream| async move {
            stream
                .write_all(&(MAX_FRAME_LEN + 1).to_be_bytes())
                .await
                .unwrap();
        })
        .await;
        let mut session = PeerSession::connect(&peer, INFO_HASH, OUR_ID, 8)
            .await
            .unwrap();
        assert!(matches!(
            session.recv().await,
            Err(PeerError::FrameTooLarge(_))
        ));
    }
}
