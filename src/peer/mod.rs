//! Peer wire protocol: handshake, framed messages, bitfields, sessions.
use thiserror::Error;

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::Message;
pub use session::PeerSession;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out during {0}")]
    Timeout(String),

    #[error("Handshake failed: invalid protocol length {0}")]
    InvalidProtocolLength(u8),

    #[error("Handshake failed: invalid protocol identifier")]
    InvalidProtocol,

    #[error("Handshake failed: info hash mismatch")]
    InfoHashMismatch,

    #[error("Frame of length {0} is too large")]
    FrameTooLarge(u32),

    #[error("Unknown message id {0}")]
    UnknownMessageId(u8),

    #[error("Message id {id} has invalid length {len}")]
    BadMessageLength { id: u8, len: usize },

    #[error("BITFIELD received after the first message")]
    BitfieldAfterStart,

    #[error("BITFIELD length {got} does not match expected {want}")]
    BitfieldLength { got: usize, want: usize },

    #[error("BITFIELD has bits set beyond the last piece")]
    BitfieldSpareBits,

    #[error("HAVE for out-of-range piece {0}")]
    HaveOutOfRange(u32),

    #[error("PIECE for block we did not request: index {index}, begin {begin}")]
    UnrequestedBlock { index: u32, begin: u32 },

    #[error("Piece {index} failed hash verification")]
    PieceHashMismatch { index: u32 },
}

impl PeerError {
    /// Network-level failures, as opposed to protocol violations. The two
    /// map to different top-level error categories.
    pub fn is_network(&self) -> bool {
        matches!(self, PeerError::Io(_) | PeerError::Timeout(_))
    }
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;
