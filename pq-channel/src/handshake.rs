//! Hybrid X25519 + ML-KEM-768 key exchange.
//!
//! The session key is derived from both shared secrets, so it stays secret
//! while either primitive holds:
//!
//! ```text
//! transcript  = SHA-256(PROTOCOL_ID, KEM id, init_x25519, init_kem_pk, resp_x25519, kem_ct)
//! session_key = HKDF-SHA256(salt = transcript, ikm = x25519_ss || kem_ss || transcript)
//! ```
//!
//! Per-direction stream keys and key-confirmation values are expanded from
//! the session key. Ephemeral keypairs are generated per call and consumed by
//! [`HybridKeyExchange::finish`], so they cannot be reused across sessions.

use std::fmt;

use crypto::identity::{IdentityKeypair, IdentityPublicKey, IdentitySignature};
use crypto::ml_kem::{MlKemCiphertext, MlKemKeyPair, MlKemPublicKey, ML_KEM_ALGORITHM};
use crypto::traits::{KemKeyPair, KemPublicKey, Signature, SigningKey, VerifyKey};
use crypto::x25519::X25519KeyPair;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::HandshakeError;
use crate::types::{IdentityFrame, Role, CONFIRMATION_LEN, PROTOCOL_ID, SESSION_ID_LEN};

const LABEL_SESSION_KEY: &[u8] = b"pq-transfer-v1-session-key";
const LABEL_INITIATOR_TO_RESPONDER: &[u8] = b"pq-transfer-v1-i2r";
const LABEL_RESPONDER_TO_INITIATOR: &[u8] = b"pq-transfer-v1-r2i";
const LABEL_CONFIRM_INITIATOR: &[u8] = b"pq-transfer-v1-confirm-initiator";
const LABEL_CONFIRM_RESPONDER: &[u8] = b"pq-transfer-v1-confirm-responder";
const LABEL_IDENTITY: &[u8] = b"pq-transfer-v1-identity";

pub const SESSION_KEY_LEN: usize = 32;

/// Handshake progress, named from the initiator's point of view.
///
/// The responder walks the same states: `SentHello` once the HELLO exchange
/// happened, `ReceivedResponse` once the RESPONSE exchange happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    SentHello,
    ReceivedResponse,
    KeyDerived,
    Active,
    Failed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::Init => "INIT",
            HandshakeState::SentHello => "SENT_HELLO",
            HandshakeState::ReceivedResponse => "RECEIVED_RESPONSE",
            HandshakeState::KeyDerived => "KEY_DERIVED",
            HandshakeState::Active => "ACTIVE",
            HandshakeState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Enforces the handshake order. `Failed` is terminal.
#[derive(Debug)]
pub struct HandshakeStateMachine {
    state: HandshakeState,
}

impl Default for HandshakeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeStateMachine {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Init,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Move to `next`, which must directly follow the current state.
    pub fn advance(&mut self, next: HandshakeState) -> Result<(), HandshakeError> {
        use HandshakeState::*;

        let allowed = matches!(
            (self.state, next),
            (Init, SentHello)
                | (SentHello, ReceivedResponse)
                | (ReceivedResponse, KeyDerived)
                | (KeyDerived, Active)
        ) || (next == Failed && self.state != Failed);

        if !allowed {
            let from = self.state;
            self.state = Failed;
            return Err(HandshakeError::InvalidState { from, to: next });
        }
        self.state = next;
        Ok(())
    }

    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
    }
}

/// SHA-256 transcript over length-prefixed handshake values
#[derive(Clone)]
pub struct Transcript {
    hasher: Sha256,
}

impl Transcript {
    pub fn new() -> Self {
        let mut transcript = Self {
            hasher: Sha256::new(),
        };
        transcript.update(PROTOCOL_ID);
        transcript.update(ML_KEM_ALGORITHM.as_bytes());
        transcript
    }

    pub fn update(&mut self, data: &[u8]) {
        crypto::hashes::update_length_prefixed(&mut self.hasher, data);
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

fn transcript_hash(
    initiator_classical: &[u8],
    initiator_kem: &[u8],
    responder_classical: &[u8],
    kem_ciphertext: &[u8],
) -> [u8; 32] {
    let mut transcript = Transcript::new();
    transcript.update(initiator_classical);
    transcript.update(initiator_kem);
    transcript.update(responder_classical);
    transcript.update(kem_ciphertext);
    transcript.hash()
}

/// Keys derived from one handshake. Every secret is wiped on drop.
pub struct SessionKeys {
    session_id: [u8; SESSION_ID_LEN],
    transcript_hash: [u8; 32],
    session_key: Zeroizing<[u8; SESSION_KEY_LEN]>,
    initiator_to_responder: Zeroizing<[u8; 32]>,
    responder_to_initiator: Zeroizing<[u8; 32]>,
    initiator_confirmation: Zeroizing<[u8; CONFIRMATION_LEN]>,
    responder_confirmation: Zeroizing<[u8; CONFIRMATION_LEN]>,
}

impl SessionKeys {
    /// Derive the session key and its sub-keys from both shared secrets.
    pub fn derive(
        classical_shared: &[u8; 32],
        kem_shared: &[u8; 32],
        transcript_hash: [u8; 32],
    ) -> Result<Self, HandshakeError> {
        let mut ikm = Zeroizing::new(Vec::with_capacity(96));
        ikm.extend_from_slice(classical_shared);
        ikm.extend_from_slice(kem_shared);
        ikm.extend_from_slice(&transcript_hash);

        let hk = Hkdf::<Sha256>::new(Some(&transcript_hash), &ikm);
        let mut session_key = Zeroizing::new([0u8; SESSION_KEY_LEN]);
        hk.expand(LABEL_SESSION_KEY, &mut session_key[..])
            .map_err(|_| HandshakeError::KeyDerivation)?;

        let sub = Hkdf::<Sha256>::new(Some(&transcript_hash), &session_key[..]);
        let expand = |label: &[u8]| -> Result<Zeroizing<[u8; 32]>, HandshakeError> {
            let mut out = Zeroizing::new([0u8; 32]);
            sub.expand(label, &mut out[..])
                .map_err(|_| HandshakeError::KeyDerivation)?;
            Ok(out)
        };

        let mut session_id = [0u8; SESSION_ID_LEN];
        session_id.copy_from_slice(&transcript_hash[..SESSION_ID_LEN]);

        Ok(Self {
            session_id,
            transcript_hash,
            initiator_to_responder: expand(LABEL_INITIATOR_TO_RESPONDER)?,
            responder_to_initiator: expand(LABEL_RESPONDER_TO_INITIATOR)?,
            initiator_confirmation: expand(LABEL_CONFIRM_INITIATOR)?,
            responder_confirmation: expand(LABEL_CONFIRM_RESPONDER)?,
            session_key,
        })
    }

    pub fn session_id(&self) -> &[u8; SESSION_ID_LEN] {
        &self.session_id
    }

    pub fn transcript_hash(&self) -> &[u8; 32] {
        &self.transcript_hash
    }

    pub fn session_key(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.session_key
    }

    /// Stream key for chunks sent by `role`.
    pub fn stream_key(&self, sender: Role) -> &[u8; 32] {
        match sender {
            Role::Initiator => &self.initiator_to_responder,
            Role::Responder => &self.responder_to_initiator,
        }
    }

    /// Key confirmation value `role` proves to its peer.
    pub fn confirmation(&self, role: Role) -> &[u8; CONFIRMATION_LEN] {
        match role {
            Role::Initiator => &self.initiator_confirmation,
            Role::Responder => &self.responder_confirmation,
        }
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("session_id", &hex::encode(self.session_id))
            .finish_non_exhaustive()
    }
}

/// Initiator secrets kept between HELLO and RESPONSE.
pub struct EphemeralState {
    classical: X25519KeyPair,
    kem: MlKemKeyPair,
    classical_public: [u8; 32],
    kem_public: Vec<u8>,
}

impl fmt::Debug for EphemeralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralState")
            .field("classical_public", &hex::encode(self.classical_public))
            .finish_non_exhaustive()
    }
}

pub struct HybridKeyExchange;

impl HybridKeyExchange {
    /// Fresh X25519 and ML-KEM keypairs for one handshake.
    pub fn initiate() -> ([u8; 32], Vec<u8>, EphemeralState) {
        let classical = X25519KeyPair::generate();
        let kem = MlKemKeyPair::generate();
        let classical_public = classical.public_key();
        let kem_public = kem.public_key().to_bytes();
        let state = EphemeralState {
            classical,
            kem,
            classical_public,
            kem_public: kem_public.clone(),
        };
        (classical_public, kem_public, state)
    }

    /// Responder side: agree, encapsulate and derive in one step.
    pub fn respond(
        peer_classical_public: &[u8],
        peer_kem_public: &[u8],
    ) -> Result<([u8; 32], Vec<u8>, SessionKeys), HandshakeError> {
        let peer_kem = MlKemPublicKey::from_bytes(peer_kem_public)?;

        let classical = X25519KeyPair::generate();
        let classical_public = classical.public_key();
        let classical_shared = classical.agree(peer_classical_public)?;

        let (ciphertext, kem_shared) = peer_kem.encapsulate()?;
        let kem_ciphertext = ciphertext.as_bytes().to_vec();

        let transcript = transcript_hash(
            peer_classical_public,
            peer_kem_public,
            &classical_public,
            &kem_ciphertext,
        );
        let keys = SessionKeys::derive(&classical_shared, kem_shared.as_bytes(), transcript)?;
        Ok((classical_public, kem_ciphertext, keys))
    }

    /// Initiator side: consume the ephemeral state and derive the same keys.
    pub fn finish(
        state: EphemeralState,
        peer_classical_public: &[u8],
        kem_ciphertext: &[u8],
    ) -> Result<SessionKeys, HandshakeError> {
        let EphemeralState {
            classical,
            kem,
            classical_public,
            kem_public,
        } = state;

        let ciphertext = MlKemCiphertext::from_bytes(kem_ciphertext)?;
        let classical_shared = classical.agree(peer_classical_public)?;
        let kem_shared = kem.decapsulate(&ciphertext)?;

        let transcript = transcript_hash(
            &classical_public,
            &kem_public,
            peer_classical_public,
            kem_ciphertext,
        );
        SessionKeys::derive(&classical_shared, kem_shared.as_bytes(), transcript)
    }
}

fn identity_message(role: Role, transcript_hash: &[u8; 32]) -> Vec<u8> {
    let mut message = Vec::with_capacity(LABEL_IDENTITY.len() + 9 + 32);
    message.extend_from_slice(LABEL_IDENTITY);
    message.extend_from_slice(role.label());
    message.extend_from_slice(transcript_hash);
    message
}

/// IDENTITY frame proving `role` holds `identity` and derived the same keys.
pub fn identity_proof(identity: &IdentityKeypair, keys: &SessionKeys, role: Role) -> IdentityFrame {
    let signature = identity.sign(&identity_message(role, keys.transcript_hash()));
    IdentityFrame {
        identity_public: identity.public_key().to_bytes(),
        signature: signature.to_vec(),
        key_confirmation: *keys.confirmation(role),
    }
}

/// Check the peer's IDENTITY frame and return its identity key.
pub fn verify_identity_proof(
    frame: &IdentityFrame,
    keys: &SessionKeys,
    peer_role: Role,
) -> Result<IdentityPublicKey, HandshakeError> {
    let expected = keys.confirmation(peer_role);
    if !bool::from(expected[..].ct_eq(&frame.key_confirmation[..])) {
        return Err(HandshakeError::TranscriptMismatch);
    }

    let public = IdentityPublicKey::from_bytes(&frame.identity_public)?;
    let signature = IdentitySignature::from_bytes(&frame.signature)
        .map_err(|_| HandshakeError::InvalidSignature)?;
    public
        .verify(&identity_message(peer_role, keys.transcript_hash()), &signature)
        .map_err(|_| HandshakeError::InvalidSignature)?;
    Ok(public)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> (SessionKeys, SessionKeys) {
        let (init_classical, init_kem, state) = HybridKeyExchange::initiate();
        let (resp_classical, ciphertext, responder) =
            HybridKeyExchange::respond(&init_classical, &init_kem).unwrap();
        let initiator = HybridKeyExchange::finish(state, &resp_classical, &ciphertext).unwrap();
        (initiator, responder)
    }

    #[test]
    fn both_sides_derive_identical_keys() {
        let (initiator, responder) = exchange();
        assert_eq!(initiator.session_key(), responder.session_key());
        assert_eq!(initiator.session_id(), responder.session_id());
        assert_eq!(
            initiator.stream_key(Role::Initiator),
            responder.stream_key(Role::Initiator)
        );
        assert_eq!(
            initiator.stream_key(Role::Responder),
            responder.stream_key(Role::Responder)
        );
        assert_ne!(
            initiator.stream_key(Role::Initiator),
            initiator.stream_key(Role::Responder)
        );
    }

    #[test]
    fn each_exchange_yields_a_fresh_key() {
        let (a, _) = exchange();
        let (b, _) = exchange();
        assert_ne!(a.session_key(), b.session_key());
        assert_ne!(a.session_id(), b.session_id());
    }

    #[test]
    fn wrong_length_classical_key_rejected() {
        let (_, init_kem, _) = HybridKeyExchange::initiate();
        let err = HybridKeyExchange::respond(&[7u8; 31], &init_kem).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn low_order_classical_key_rejected() {
        let (_, init_kem, _) = HybridKeyExchange::initiate();
        let err = HybridKeyExchange::respond(&[0u8; 32], &init_kem).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn malformed_kem_key_rejected() {
        let (init_classical, _, _) = HybridKeyExchange::initiate();
        let err = HybridKeyExchange::respond(&init_classical, &[0xff; 1184]).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKeyMaterial(_)));
        let err = HybridKeyExchange::respond(&init_classical, &[0u8; 100]).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn malformed_ciphertext_rejected() {
        let (init_classical, init_kem, state) = HybridKeyExchange::initiate();
        let (resp_classical, _, _) = HybridKeyExchange::respond(&init_classical, &init_kem).unwrap();
        let err = HybridKeyExchange::finish(state, &resp_classical, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn corrupted_classical_value_fails_confirmation_on_both_sides() {
        let (mut init_classical, init_kem, state) = HybridKeyExchange::initiate();
        init_classical[5] ^= 0x01;
        let (resp_classical, ciphertext, responder) =
            HybridKeyExchange::respond(&init_classical, &init_kem).unwrap();
        let initiator = HybridKeyExchange::finish(state, &resp_classical, &ciphertext).unwrap();
        assert_ne!(initiator.session_key(), responder.session_key());

        let alice = IdentityKeypair::generate();
        let bob = IdentityKeypair::generate();
        let from_initiator = identity_proof(&alice, &initiator, Role::Initiator);
        let from_responder = identity_proof(&bob, &responder, Role::Responder);

        assert!(matches!(
            verify_identity_proof(&from_initiator, &responder, Role::Initiator),
            Err(HandshakeError::TranscriptMismatch)
        ));
        assert!(matches!(
            verify_identity_proof(&from_responder, &initiator, Role::Responder),
            Err(HandshakeError::TranscriptMismatch)
        ));
    }

    #[test]
    fn corrupted_ciphertext_fails_confirmation() {
        let (init_classical, init_kem, state) = HybridKeyExchange::initiate();
        let (resp_classical, mut ciphertext, responder) =
            HybridKeyExchange::respond(&init_classical, &init_kem).unwrap();
        ciphertext[0] ^= 0x80;
        let initiator = HybridKeyExchange::finish(state, &resp_classical, &ciphertext).unwrap();

        let bob = IdentityKeypair::generate();
        let proof = identity_proof(&bob, &responder, Role::Responder);
        assert!(matches!(
            verify_identity_proof(&proof, &initiator, Role::Responder),
            Err(HandshakeError::TranscriptMismatch)
        ));
    }

    #[test]
    fn identity_proof_round_trip() {
        let (initiator, responder) = exchange();
        let alice = IdentityKeypair::generate();
        let proof = identity_proof(&alice, &initiator, Role::Initiator);
        let public = verify_identity_proof(&proof, &responder, Role::Initiator).unwrap();
        assert_eq!(public.fingerprint(), alice.fingerprint());
    }

    #[test]
    fn identity_proof_cannot_be_reflected() {
        let (initiator, responder) = exchange();
        let alice = IdentityKeypair::generate();
        let proof = identity_proof(&alice, &initiator, Role::Initiator);
        assert!(matches!(
            verify_identity_proof(&proof, &responder, Role::Responder),
            Err(HandshakeError::TranscriptMismatch)
        ));
    }

    #[test]
    fn forged_signature_rejected() {
        let (initiator, responder) = exchange();
        let alice = IdentityKeypair::generate();
        let mut proof = identity_proof(&alice, &initiator, Role::Initiator);
        proof.signature[0] ^= 0xff;
        assert!(matches!(
            verify_identity_proof(&proof, &responder, Role::Initiator),
            Err(HandshakeError::InvalidSignature)
        ));
    }

    #[test]
    fn state_machine_rejects_skipped_steps() {
        let mut machine = HandshakeStateMachine::new();
        let err = machine.advance(HandshakeState::KeyDerived).unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::InvalidState {
                from: HandshakeState::Init,
                to: HandshakeState::KeyDerived
            }
        ));
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn state_machine_full_path_and_terminal_failure() {
        let mut machine = HandshakeStateMachine::new();
        for next in [
            HandshakeState::SentHello,
            HandshakeState::ReceivedResponse,
            HandshakeState::KeyDerived,
            HandshakeState::Active,
        ] {
            machine.advance(next).unwrap();
        }
        assert_eq!(machine.state(), HandshakeState::Active);

        machine.fail();
        assert!(machine.advance(HandshakeState::Init).is_err());
        assert!(machine.advance(HandshakeState::Failed).is_err());
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn transcript_binds_every_value() {
        let base = transcript_hash(b"a", b"b", b"c", b"d");
        assert_ne!(base, transcript_hash(b"a", b"b", b"c", b"e"));
        assert_ne!(base, transcript_hash(b"ab", b"", b"c", b"d"));
    }
}
