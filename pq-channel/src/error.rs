//! Error types for the transfer channel

use crypto::{CryptoError, Fingerprint};
use thiserror::Error;

use crate::channel::ChannelState;
use crate::handshake::HandshakeState;
use crate::types::{AbortReason, FrameError};

/// Errors surfaced by channel and stream operations
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Handshake failed; the session never became usable
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// A chunk failed AEAD authentication
    #[error("chunk {sequence} failed authentication")]
    Integrity { sequence: u64 },

    /// A chunk arrived out of order or after the final chunk
    #[error("ordering error: {0}")]
    Ordering(OrderingViolation),

    /// Every chunk authenticated but the whole-stream digest or size differs
    #[error("stream digest mismatch")]
    DigestMismatch,

    /// The START frame failed authentication
    #[error("transfer offer failed authentication")]
    OfferIntegrity,

    /// The receiver refused the offered transfer
    #[error("transfer offer rejected")]
    OfferRejected,

    /// The verified payload size differs from the size the offer declared
    #[error("offer declared {declared} bytes, stream carried {actual}")]
    DeclaredSizeMismatch { declared: u64, actual: u64 },

    /// The transport ended before the final chunk
    #[error("transfer truncated after {chunks_received} chunks")]
    TruncatedTransfer { chunks_received: u64 },

    /// The peer sent ABORT
    #[error("peer aborted: {0}")]
    PeerAborted(AbortReason),

    /// A frame that is valid but not allowed at this point
    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),

    /// The transport closed where a reply was required
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed wire frame
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error on the transport, source or sink
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout during the handshake
    #[error("operation timed out")]
    Timeout,

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The channel is in a state that does not allow the operation
    #[error("channel unusable in state {0}")]
    ChannelUnusable(ChannelState),

    /// Chunk counter cannot advance without reusing a nonce
    #[error("chunk sequence number exhausted")]
    SequenceExhausted,

    /// Encryption failure
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Cryptographic primitive failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ChannelError {
    /// True for failures of per-chunk or whole-stream integrity.
    pub fn is_stream_integrity_failure(&self) -> bool {
        matches!(
            self,
            ChannelError::Integrity { .. }
                | ChannelError::OfferIntegrity
                | ChannelError::Ordering(_)
                | ChannelError::DigestMismatch
                | ChannelError::DeclaredSizeMismatch { .. }
        )
    }

    /// Reason code sent to the peer when this error ends the channel.
    pub fn abort_reason(&self) -> AbortReason {
        match self {
            ChannelError::Handshake(HandshakeError::PeerIdentityMismatch { .. }) => {
                AbortReason::IdentityMismatch
            }
            ChannelError::Handshake(_) | ChannelError::Timeout => AbortReason::HandshakeFailure,
            ChannelError::Integrity { .. } | ChannelError::OfferIntegrity => {
                AbortReason::IntegrityFailure
            }
            ChannelError::OfferRejected => AbortReason::Rejected,
            ChannelError::Ordering(_) | ChannelError::TruncatedTransfer { .. } => {
                AbortReason::OrderingFailure
            }
            ChannelError::DigestMismatch | ChannelError::DeclaredSizeMismatch { .. } => {
                AbortReason::DigestMismatch
            }
            ChannelError::Frame(_) | ChannelError::UnexpectedFrame(_) => {
                AbortReason::ProtocolViolation
            }
            _ => AbortReason::LocalCancel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderingViolation {
    OutOfSequence { expected: u64, got: u64 },
    AfterFinal { sequence: u64 },
}

impl std::fmt::Display for OrderingViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderingViolation::OutOfSequence { expected, got } => {
                write!(f, "expected chunk {expected}, got {got}")
            }
            OrderingViolation::AfterFinal { sequence } => {
                write!(f, "chunk {sequence} after final chunk")
            }
        }
    }
}

/// Specific handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Wrong length, low-order point or otherwise unusable key material
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    /// Key confirmation from the peer does not match our transcript
    #[error("transcript mismatch")]
    TranscriptMismatch,

    /// Peer identity does not match the pinned fingerprint
    #[error("peer identity mismatch: expected {expected}, got {actual}")]
    PeerIdentityMismatch {
        expected: Fingerprint,
        actual: Fingerprint,
    },

    /// Invalid signature from peer
    #[error("invalid signature")]
    InvalidSignature,

    /// Unexpected message type received
    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    /// Protocol version mismatch
    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u8, remote: u8 },

    #[error("unsupported KEM algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Connection closed during handshake
    #[error("connection closed during handshake")]
    ConnectionClosed,

    /// Peer sent ABORT during the handshake
    #[error("peer aborted handshake: {0}")]
    Aborted(AbortReason),

    /// Handshake step taken out of order
    #[error("invalid handshake transition {from} -> {to}")]
    InvalidState {
        from: HandshakeState,
        to: HandshakeState,
    },

    /// Key derivation failed
    #[error("key derivation failed")]
    KeyDerivation,
}

impl From<CryptoError> for HandshakeError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::VerificationFailed => HandshakeError::InvalidSignature,
            CryptoError::UnsupportedAlgorithm(alg) => HandshakeError::UnsupportedAlgorithm(alg),
            other => HandshakeError::InvalidKeyMaterial(other.to_string()),
        }
    }
}

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;
