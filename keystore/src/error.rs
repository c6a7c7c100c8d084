use crypto::{CryptoError, Fingerprint};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key {0:?} not found")]
    KeyNotFound(String),

    #[error("key {0:?} already exists")]
    KeyExists(String),

    #[error("contact {0:?} not found")]
    ContactNotFound(String),

    #[error("contact {0:?} already exists")]
    ContactExists(String),

    /// The record's AEAD tag did not verify under the supplied passphrase.
    #[error("wrong passphrase")]
    WrongPassphrase,

    #[error("invalid key name {0:?}: use 1-64 of [A-Za-z0-9_.-], not starting with '.'")]
    InvalidName(String),

    #[error("record is for key {found:?}, not {expected:?}")]
    NameMismatch { expected: String, found: String },

    #[error("archived key {name:?} ({fingerprint}) is past its grace period")]
    Expired {
        name: String,
        fingerprint: Fingerprint,
    },

    #[error("corrupt key record: {0}")]
    Corrupt(String),

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u32),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid public key encoding: {0}")]
    InvalidEncoding(String),

    #[error("audit log error: {0}")]
    Audit(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<bincode::Error> for KeyStoreError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for KeyStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeyStoreError>;
