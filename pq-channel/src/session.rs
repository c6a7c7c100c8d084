//! Per-connection session state

use crypto::Fingerprint;

use crate::error::{ChannelError, HandshakeError, Result};
use crate::handshake::{HandshakeState, HandshakeStateMachine, SessionKeys};
use crate::types::{Role, SESSION_ID_LEN};

/// One handshake and its keys. Never resumed; the keys are dropped (and
/// wiped) as soon as the session ends.
#[derive(Debug)]
pub struct Session {
    role: Role,
    handshake: HandshakeStateMachine,
    session_id: Option<[u8; SESSION_ID_LEN]>,
    keys: Option<SessionKeys>,
    peer_fingerprint: Option<Fingerprint>,
    chunk_counter: u64,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            handshake: HandshakeStateMachine::new(),
            session_id: None,
            keys: None,
            peer_fingerprint: None,
            chunk_counter: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn session_id(&self) -> Option<[u8; SESSION_ID_LEN]> {
        self.session_id
    }

    pub fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.peer_fingerprint
    }

    /// Chunks moved over this session so far, both directions.
    pub fn chunk_counter(&self) -> u64 {
        self.chunk_counter
    }

    pub fn has_keys(&self) -> bool {
        self.keys.is_some()
    }

    pub fn advance(&mut self, next: HandshakeState) -> std::result::Result<(), HandshakeError> {
        self.handshake.advance(next)
    }

    /// Record derived keys; the handshake must be at `ReceivedResponse`.
    pub fn install_keys(&mut self, keys: SessionKeys) -> std::result::Result<(), HandshakeError> {
        self.handshake.advance(HandshakeState::KeyDerived)?;
        self.session_id = Some(*keys.session_id());
        self.keys = Some(keys);
        Ok(())
    }

    pub fn keys(&self) -> Result<&SessionKeys> {
        self.keys
            .as_ref()
            .ok_or(ChannelError::Handshake(HandshakeError::InvalidState {
                from: self.handshake.state(),
                to: HandshakeState::Active,
            }))
    }

    pub fn activate(&mut self, peer: Fingerprint) -> std::result::Result<(), HandshakeError> {
        self.handshake.advance(HandshakeState::Active)?;
        self.peer_fingerprint = Some(peer);
        Ok(())
    }

    /// Key for chunks this side sends.
    pub fn send_key(&self) -> Result<&[u8; 32]> {
        Ok(self.keys()?.stream_key(self.role))
    }

    /// Key for chunks the peer sends.
    pub fn receive_key(&self) -> Result<&[u8; 32]> {
        Ok(self.keys()?.stream_key(self.role.peer()))
    }

    pub fn record_chunks(&mut self, count: u64) {
        self.chunk_counter = self.chunk_counter.saturating_add(count);
    }

    /// Drop the keys without failing the handshake record (normal end).
    pub fn release_keys(&mut self) {
        self.keys = None;
    }

    /// Mark the session failed and drop its keys.
    pub fn fail(&mut self) {
        self.handshake.fail();
        self.keys = None;
    }
}
