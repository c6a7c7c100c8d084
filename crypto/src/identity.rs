//! Long-term identity keys.
//!
//! An identity authenticates a handshake transcript; it never protects
//! payload confidentiality, which comes from the hybrid exchange.

use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::hashes::sha256;
use crate::traits::{Signature, SigningKey, VerifyKey};

pub const IDENTITY_ALGORITHM: &str = "ed25519";
pub const IDENTITY_PUBLIC_KEY_LEN: usize = 32;
pub const IDENTITY_PRIVATE_KEY_LEN: usize = 32;
pub const IDENTITY_SIGNATURE_LEN: usize = 64;
pub const FINGERPRINT_LEN: usize = 32;

/// SHA-256 of the raw public key encoding.
#[derive(Clone, Copy, Eq, Serialize, Deserialize)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn of(public_key: &[u8]) -> Self {
        Self(sha256(public_key))
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let arr: [u8; FINGERPRINT_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    expected: FINGERPRINT_LEN,
                    actual: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight bytes in hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl core::hash::Hash for Fingerprint {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// Fingerprint of a raw public key.
pub fn fingerprint(public_key: &[u8]) -> Fingerprint {
    Fingerprint::of(public_key)
}

#[derive(Clone, PartialEq, Eq)]
pub struct IdentitySignature([u8; IDENTITY_SIGNATURE_LEN]);

impl IdentitySignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; IDENTITY_SIGNATURE_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: IDENTITY_SIGNATURE_LEN,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }
}

impl Signature for IdentitySignature {
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for IdentitySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentitySignature({}..)", hex::encode(&self.0[..8]))
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct IdentityPublicKey {
    key: ed25519_dalek::VerifyingKey,
}

impl IdentityPublicKey {
    pub fn as_bytes(&self) -> &[u8; IDENTITY_PUBLIC_KEY_LEN] {
        self.key.as_bytes()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.key.as_bytes())
    }
}

impl VerifyKey for IdentityPublicKey {
    type Signature = IdentitySignature;

    fn verify(&self, message: &[u8], signature: &IdentitySignature) -> Result<(), CryptoError> {
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.key
            .verify(message, &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.key.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; IDENTITY_PUBLIC_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidLength {
                expected: IDENTITY_PUBLIC_KEY_LEN,
                actual: bytes.len(),
            })?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&arr)
            .map_err(|_| CryptoError::InvalidKey("ed25519 public key is not a curve point"))?;
        if key.is_weak() {
            return Err(CryptoError::InvalidKey("ed25519 public key has small order"));
        }
        Ok(Self { key })
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityPublicKey({})", self.fingerprint().short())
    }
}

/// Long-term signing identity. The secret scalar is wiped when dropped.
pub struct IdentityKeypair {
    signing: ed25519_dalek::SigningKey,
    created_at: u64,
    fingerprint: Fingerprint,
}

impl IdentityKeypair {
    /// Rebuild a keypair from stored parts, checking that the stored public
    /// key matches the private key.
    pub fn from_parts(
        algorithm_id: &str,
        private_key: &[u8],
        public_key: &[u8],
        created_at: u64,
    ) -> Result<Self, CryptoError> {
        if algorithm_id != IDENTITY_ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(algorithm_id.to_string()));
        }
        let secret: Zeroizing<[u8; IDENTITY_PRIVATE_KEY_LEN]> = Zeroizing::new(
            private_key
                .try_into()
                .map_err(|_| CryptoError::InvalidLength {
                    expected: IDENTITY_PRIVATE_KEY_LEN,
                    actual: private_key.len(),
                })?,
        );
        let signing = ed25519_dalek::SigningKey::from_bytes(&secret);
        if signing.verifying_key().as_bytes()[..] != *public_key {
            return Err(CryptoError::InvalidKey(
                "public key does not match private key",
            ));
        }
        let fingerprint = Fingerprint::of(public_key);
        Ok(Self {
            signing,
            created_at,
            fingerprint,
        })
    }

    pub fn algorithm_id(&self) -> &'static str {
        IDENTITY_ALGORITHM
    }

    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            key: self.signing.verifying_key(),
        }
    }

    pub fn private_key_bytes(&self) -> Zeroizing<[u8; IDENTITY_PRIVATE_KEY_LEN]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl SigningKey for IdentityKeypair {
    type VerifyKey = IdentityPublicKey;
    type Signature = IdentitySignature;

    fn generate() -> Self {
        let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let fingerprint = Fingerprint::of(signing.verifying_key().as_bytes());
        Self {
            signing,
            created_at: current_timestamp(),
            fingerprint,
        }
    }

    fn sign(&self, message: &[u8]) -> IdentitySignature {
        IdentitySignature(self.signing.sign(message).to_bytes())
    }

    fn verify_key(&self) -> IdentityPublicKey {
        self.public_key()
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("algorithm_id", &IDENTITY_ALGORITHM)
            .field("fingerprint", &self.fingerprint)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
