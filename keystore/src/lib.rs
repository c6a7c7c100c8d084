//! Encrypted-at-rest store for long-term channel identities.
//!
//! Each key is one bincode record whose private half is sealed with
//! ChaCha20-Poly1305 under an Argon2id-derived key. Rotation keeps the
//! previous key in an archive for a grace period, and every operation is
//! appended to a hash-chained audit log. Peers' public keys can be pinned
//! by name as contacts.

pub mod audit;
pub mod config;
pub mod error;
pub mod export;
pub mod store;

pub use audit::{AuditEntry, AuditOperation, AuditSink, JsonlAuditLog, MemoryAuditLog};
pub use config::KeyStoreConfig;
pub use crypto::identity::fingerprint;
pub use error::{KeyStoreError, Result};
pub use export::{encode_public, parse_public, PublicKeyFormat};
pub use store::{validate_name, ContactInfo, KdfParams, KeyInfo, KeyManager, AUDIT_FILE};
