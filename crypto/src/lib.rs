//! Primitive collaborators for the hybrid post-quantum transfer channel.
//!
//! Nothing in this crate invents cryptography: every operation is a thin,
//! length-checked wrapper over a RustCrypto or dalek implementation.
//!
//! - [`ml_kem`]: ML-KEM-768 key encapsulation (FIPS 203)
//! - [`x25519`]: ephemeral X25519 key agreement (RFC 7748)
//! - [`identity`]: long-term Ed25519 identity keys and fingerprints
//! - [`hashes`]: SHA-256 helpers and the rolling stream digest

pub mod error;
pub mod hashes;
pub mod identity;
pub mod ml_kem;
pub mod traits;
pub mod x25519;

pub use error::CryptoError;
pub use identity::{Fingerprint, IdentityKeypair, IdentityPublicKey};
