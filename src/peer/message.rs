//! Framed peer wire messages.
//!
//! Every message carries a 4-byte big-endian length prefix followed by that
//! many body bytes; a zero length is the keep-alive. The first body byte is
//! the message id, the rest is the id-specific payload. All multi-byte
//! integers on the wire are network order.
use super::{PeerError, PeerResult};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

/// Upper bound on a frame's body length.
///
/// The largest legitimate frame is a PIECE carrying one 16 KiB block plus
/// its 9-byte header; bitfields for any realistic piece count are far
/// smaller. Anything bigger is a protocol violation, not data.
pub const MAX_FRAME_LEN: u32 = 1 << 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(0),
            Message::Unchoke => Some(1),
            Message::Interested => Some(2),
            Message::NotInterested => Some(3),
            Message::Have(_) => Some(4),
            Message::Bitfield(_) => Some(5),
            Message::Request { .. } => Some(6),
            Message::Piece { .. } => Some(7),
            Message::Cancel { .. } => Some(8),
        }
    }

    /// Serializes the message including its length prefix.
    pub fn to_bytes(&self) -> Vec<u8> {
        let body_len = match self {
            Message::KeepAlive => 0,
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 1,
            Message::Have(_) => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 13,
            Message::Piece { block, .. } => 9 + block.len(),
        };

        let mut buf = vec![0u8; 4];
        BigEndian::write_u32(&mut buf, body_len as u32);
        buf.reserve(body_len);
        if let Some(id) = self.id() {
            buf.push(id);
        }
        match self {
            Message::Have(index) => {
                buf.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                buf.extend_from_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
            }
            _ => {}
        }
        buf
    }

    /// Parses a frame body (the bytes after the length prefix). An empty
    /// body is the keep-alive.
    pub fn parse(body: &[u8]) -> PeerResult<Message> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = body[0];
        let payload = &body[1..];
        let bad_len = |id| PeerError::BadMessageLength {
            id,
            len: payload.len(),
        };
        match id {
            0 | 1 | 2 | 3 => {
                if !payload.is_empty() {
                    return Err(bad_len(id));
                }
                Ok(match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                })
            }
            4 => {
                if payload.len() != 4 {
                    return Err(bad_len(4));
                }
                Ok(Message::Have(BigEndian::read_u32(payload)))
            }
            5 => Ok(Message::Bitfield(Bytes::copy_from_slice(payload))),
            6 | 8 => {
                if payload.len() != 12 {
                    return Err(bad_len(id));
                }
                let index = BigEndian::read_u32(&payload[0..4]);
                let begin = BigEndian::read_u32(&payload[4..8]);
                let length = BigEndian::read_u32(&payload[8..12]);
                Ok(if id == 6 {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                })
            }
            7 => {
                if payload.len() < 8 {
                    return Err(bad_len(7));
                }
                Ok(Message::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: Bytes::copy_from_slice(&payload[8..]),
                })
            }
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }
}
