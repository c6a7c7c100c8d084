//! Hybrid post-quantum secure channel for streaming file transfer.
//!
//! A channel is established with a hybrid key exchange combining:
//! - Classical X25519 ECDH
//! - ML-KEM-768 encapsulation
//!
//! Both shared secrets feed one HKDF-SHA256 derivation bound to the
//! handshake transcript, so the session stays confidential unless both
//! primitives are broken. Each side then proves its long-term Ed25519
//! identity over the transcript, and the peer may be pinned by fingerprint.
//!
//! After the handshake a single payload streams as AES-256-GCM chunks.
//! Every chunk is authenticated on its own; the final chunk carries the
//! total size and SHA-256 of the whole plaintext, and the receiver only
//! commits its sink once that digest verifies. Before any DATA the sender
//! offers the transfer (name, declared size, metadata) in a sealed START
//! frame, and the receiver accepts or rejects it.
//!
//! # Example
//!
//! ```rust,ignore
//! use pq_channel::{ChannelConfig, MemorySink, SecureChannel, memory_pair};
//!
//! let (a, b) = memory_pair(64);
//! let (sender, receiver) = tokio::join!(
//!     SecureChannel::connect(a, &alice, Some(bob.fingerprint()), ChannelConfig::default()),
//!     SecureChannel::accept(b, &bob, None, ChannelConfig::default()),
//! );
//! let (mut sender, mut receiver) = (sender?, receiver?);
//!
//! let mut sink = MemorySink::new();
//! let (sent, received) = tokio::join!(
//!     sender.send_stream(file),
//!     receiver.receive_stream(&mut sink),
//! );
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod progress;
pub mod session;
pub mod sink;
pub mod stream;
pub mod transport;
pub mod types;

pub use channel::{Channel, ChannelState, SecureChannel};
pub use config::ChannelConfig;
pub use error::{ChannelError, HandshakeError, OrderingViolation, Result};
pub use handshake::{HandshakeState, HybridKeyExchange, SessionKeys};
pub use progress::TransferProgress;
pub use session::Session;
pub use sink::{ChunkSink, FileSink, MemorySink};
pub use stream::{
    open_from_reader, seal_to_writer, Chunk, StreamOpener, StreamSealer, TransferManifest,
    DEFAULT_CHUNK_SIZE,
};
pub use transport::{memory_pair, FramedTransport, MemoryTransport, MessageTransport};
pub use types::{AbortReason, Frame, Role, TransferOffer};
