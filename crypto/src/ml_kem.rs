//! ML-KEM-768 key encapsulation (FIPS 203) over the RustCrypto `ml-kem` crate.
//!
//! Decapsulation keys and shared secrets live in `Zeroizing` buffers and are
//! cleared when dropped. Encapsulation keys are checked with the FIPS 203
//! modulus test before use, so a malformed peer key is rejected instead of
//! being silently reduced.

use core::fmt;

use kem::{Decapsulate, Encapsulate};
use ml_kem::kem::{DecapsulationKey, EncapsulationKey};
use ml_kem::{EncodedSizeUser, KemCore, MlKem768, MlKem768Params};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::traits::{KemKeyPair, KemPublicKey};

/// Identifier carried in configuration and key-store records.
pub const ML_KEM_ALGORITHM: &str = "ML-KEM-768";

pub const ML_KEM_PUBLIC_KEY_LEN: usize = 1184;
pub const ML_KEM_SECRET_KEY_LEN: usize = 2400;
pub const ML_KEM_CIPHERTEXT_LEN: usize = 1088;
pub const ML_KEM_SHARED_SECRET_LEN: usize = 32;

/// ML-KEM modulus q.
const KYBER_Q: u16 = 3329;
/// Bytes of ByteEncode12(t_hat) at the front of an encapsulation key (k = 3).
const ENCODED_POLY_VECTOR_LEN: usize = 1152;

#[derive(Clone, PartialEq, Eq)]
pub struct MlKemCiphertext {
    bytes: [u8; ML_KEM_CIPHERTEXT_LEN],
}

impl MlKemCiphertext {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ML_KEM_CIPHERTEXT_LEN {
            return Err(CryptoError::InvalidLength {
                expected: ML_KEM_CIPHERTEXT_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; ML_KEM_CIPHERTEXT_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MlKemCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MlKemCiphertext({}..)", hex::encode(&self.bytes[..8]))
    }
}

#[derive(Clone)]
pub struct MlKemSharedSecret {
    bytes: Zeroizing<[u8; ML_KEM_SHARED_SECRET_LEN]>,
}

impl MlKemSharedSecret {
    /// Wrap a decapsulated secret, rejecting anything that is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ML_KEM_SHARED_SECRET_LEN {
            return Err(CryptoError::InvalidLength {
                expected: ML_KEM_SHARED_SECRET_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = Zeroizing::new([0u8; ML_KEM_SHARED_SECRET_LEN]);
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }

    pub fn as_bytes(&self) -> &[u8; ML_KEM_SHARED_SECRET_LEN] {
        &self.bytes
    }
}

impl PartialEq for MlKemSharedSecret {
    fn eq(&self, other: &Self) -> bool {
        self.bytes[..].ct_eq(&other.bytes[..]).into()
    }
}

impl Eq for MlKemSharedSecret {}

impl fmt::Debug for MlKemSharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MlKemSharedSecret(<redacted>)")
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct MlKemPublicKey {
    bytes: [u8; ML_KEM_PUBLIC_KEY_LEN],
}

impl MlKemPublicKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MlKemPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MlKemPublicKey({}..)", hex::encode(&self.bytes[..8]))
    }
}

impl KemPublicKey for MlKemPublicKey {
    type Ciphertext = MlKemCiphertext;
    type SharedSecret = MlKemSharedSecret;

    fn encapsulate(&self) -> Result<(Self::Ciphertext, Self::SharedSecret), CryptoError> {
        let encapsulation_key =
            EncapsulationKey::<MlKem768Params>::from_bytes(&self.bytes.into());
        let (ciphertext, shared_secret) = encapsulation_key
            .encapsulate(&mut OsRng)
            .map_err(|_| CryptoError::EncapsulationFailed)?;
        let ciphertext = MlKemCiphertext::from_bytes(&ciphertext[..])?;
        let shared_secret = MlKemSharedSecret::from_bytes(&shared_secret[..])?;
        Ok((ciphertext, shared_secret))
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != ML_KEM_PUBLIC_KEY_LEN {
            return Err(CryptoError::InvalidLength {
                expected: ML_KEM_PUBLIC_KEY_LEN,
                actual: bytes.len(),
            });
        }
        if !coefficients_reduced(&bytes[..ENCODED_POLY_VECTOR_LEN]) {
            return Err(CryptoError::InvalidKey("ML-KEM coefficient out of range"));
        }
        let mut arr = [0u8; ML_KEM_PUBLIC_KEY_LEN];
        arr.copy_from_slice(bytes);
        Ok(Self { bytes: arr })
    }
}

/// FIPS 203 encapsulation-key check: every 12-bit coefficient must be below q.
fn coefficients_reduced(encoded: &[u8]) -> bool {
    encoded.chunks_exact(3).all(|triple| {
        let first = u16::from(triple[0]) | (u16::from(triple[1] & 0x0f) << 8);
        let second = u16::from(triple[1] >> 4) | (u16::from(triple[2]) << 4);
        first < KYBER_Q && second < KYBER_Q
    })
}

pub struct MlKemKeyPair {
    decapsulation_key: Zeroizing<[u8; ML_KEM_SECRET_KEY_LEN]>,
    public: MlKemPublicKey,
}

impl fmt::Debug for MlKemKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlKemKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl KemKeyPair for MlKemKeyPair {
    type PublicKey = MlKemPublicKey;
    type Ciphertext = MlKemCiphertext;
    type SharedSecret = MlKemSharedSecret;

    fn generate() -> Self {
        let (decapsulation_key, encapsulation_key) = MlKem768::generate(&mut OsRng);

        let mut dk_bytes = Zeroizing::new([0u8; ML_KEM_SECRET_KEY_LEN]);
        dk_bytes.copy_from_slice(&decapsulation_key.as_bytes()[..]);
        let mut ek_bytes = [0u8; ML_KEM_PUBLIC_KEY_LEN];
        ek_bytes.copy_from_slice(&encapsulation_key.as_bytes()[..]);

        Self {
            decapsulation_key: dk_bytes,
            public: MlKemPublicKey { bytes: ek_bytes },
        }
    }

    fn decapsulate(
        &self,
        ciphertext: &Self::Ciphertext,
    ) -> Result<Self::SharedSecret, CryptoError> {
        let decapsulation_key =
            DecapsulationKey::<MlKem768Params>::from_bytes(&(*self.decapsulation_key).into());
        let shared_secret = decapsulation_key
            .decapsulate(&ciphertext.bytes.into())
            .map_err(|_| CryptoError::DecapsulationFailed)?;
        MlKemSharedSecret::from_bytes(&shared_secret[..])
    }

    fn public_key(&self) -> Self::PublicKey {
        self.public.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encapsulate_decapsulate_agree() {
        let recipient = MlKemKeyPair::generate();
        let (ciphertext, sender_secret) = recipient.public_key().encapsulate().unwrap();
        let recipient_secret = recipient.decapsulate(&ciphertext).unwrap();
        assert_eq!(sender_secret, recipient_secret);
        assert_eq!(recipient.public_key().to_bytes().len(), ML_KEM_PUBLIC_KEY_LEN);
        assert_eq!(ciphertext.as_bytes().len(), ML_KEM_CIPHERTEXT_LEN);
    }

    #[test]
    fn fresh_keypairs_differ() {
        let a = MlKemKeyPair::generate();
        let b = MlKemKeyPair::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn public_key_wrong_length_rejected() {
        let err = MlKemPublicKey::from_bytes(&[0u8; ML_KEM_PUBLIC_KEY_LEN - 1]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidLength {
                expected: ML_KEM_PUBLIC_KEY_LEN,
                actual: ML_KEM_PUBLIC_KEY_LEN - 1
            }
        );
    }

    #[test]
    fn unreduced_public_key_rejected() {
        let err = MlKemPublicKey::from_bytes(&[0xff; ML_KEM_PUBLIC_KEY_LEN]).unwrap_err();
        assert!(matches!(err, CryptoError::InvalidKey(_)));
    }

    #[test]
    fn generated_public_key_round_trips() {
        let pair = MlKemKeyPair::generate();
        let bytes = pair.public_key().to_bytes();
        let parsed = MlKemPublicKey::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, pair.public_key());
    }

    #[test]
    fn ciphertext_wrong_length_rejected() {
        assert!(MlKemCiphertext::from_bytes(&[0u8; 12]).is_err());
    }

    #[test]
    fn shared_secret_implausible_length_rejected() {
        assert!(MlKemSharedSecret::from_bytes(&[0u8; 16]).is_err());
        assert!(MlKemSharedSecret::from_bytes(&[0u8; 64]).is_err());
    }

    #[test]
    fn tampered_ciphertext_yields_different_secret() {
        // ML-KEM decapsulation uses implicit rejection: a modified ciphertext
        // decapsulates to an unrelated secret instead of an error.
        let recipient = MlKemKeyPair::generate();
        let (ciphertext, sender_secret) = recipient.public_key().encapsulate().unwrap();
        let mut bytes = ciphertext.as_bytes().to_vec();
        bytes[0] ^= 0x01;
        let tampered = MlKemCiphertext::from_bytes(&bytes).unwrap();
        let recipient_secret = recipient.decapsulate(&tampered).unwrap();
        assert_ne!(sender_secret, recipient_secret);
    }
}
