//! Ephemeral X25519 key agreement (RFC 7748).
//!
//! The secret half is an `EphemeralSecret`, which `agree` consumes: a keypair
//! cannot be reused for a second agreement.

use core::fmt;

use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const X25519_PUBLIC_KEY_LEN: usize = 32;
pub const X25519_SHARED_SECRET_LEN: usize = 32;

pub struct X25519KeyPair {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; X25519_PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    /// Diffie-Hellman with the peer's public key.
    ///
    /// Rejects peer keys that yield a non-contributory (low-order) result.
    pub fn agree(
        self,
        peer_public: &[u8],
    ) -> Result<Zeroizing<[u8; X25519_SHARED_SECRET_LEN]>, CryptoError> {
        let peer = parse_public_key(peer_public)?;
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKey("X25519 low-order point"));
        }
        Ok(Zeroizing::new(shared.to_bytes()))
    }
}

impl fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X25519KeyPair({})", hex::encode(self.public.as_bytes()))
    }
}

pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let arr: [u8; X25519_PUBLIC_KEY_LEN] =
        bytes.try_into().map_err(|_| CryptoError::InvalidLength {
            expected: X25519_PUBLIC_KEY_LEN,
            actual: bytes.len(),
        })?;
    Ok(PublicKey::from(arr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let alice = X25519KeyPair::generate();
        let bob = X25519KeyPair::generate();
        let alice_public = alice.public_key();
        let bob_public = bob.public_key();

        let alice_shared = alice.agree(&bob_public).unwrap();
        let bob_shared = bob.agree(&alice_public).unwrap();
        assert_eq!(*alice_shared, *bob_shared);
    }

    #[test]
    fn low_order_point_rejected() {
        let alice = X25519KeyPair::generate();
        let err = alice.agree(&[0u8; 32]).unwrap_err();
        assert_eq!(err, CryptoError::InvalidKey("X25519 low-order point"));
    }

    #[test]
    fn short_public_key_rejected() {
        let alice = X25519KeyPair::generate();
        let err = alice.agree(&[9u8; 31]).unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidLength {
                expected: 32,
                actual: 31
            }
        );
    }
}
