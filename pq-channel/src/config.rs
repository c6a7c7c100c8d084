//! Configuration for transfer channels

use std::time::Duration;

use crypto::ml_kem::ML_KEM_ALGORITHM;
use serde::{Deserialize, Serialize};

use crate::error::{ChannelError, Result};
use crate::stream::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE, TRAILER_LEN};
use crate::types::{DATA_FRAME_OVERHEAD, HANDSHAKE_FRAME_LIMIT};

/// Configuration for one channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Plaintext bytes per DATA frame
    pub chunk_size_bytes: usize,

    /// KEM identifier; only ML-KEM-768 is accepted
    pub kem_algorithm: String,

    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,

    /// Whether the sender waits for the receiver's ACK
    pub await_receipt: bool,

    /// Whether to log per-frame detail
    pub verbose_logging: bool,

    /// Chunks between `transfer progress` events; 0 logs only the end
    pub progress_interval_chunks: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            kem_algorithm: ML_KEM_ALGORITHM.to_string(),
            handshake_timeout_ms: 30_000,
            await_receipt: true,
            verbose_logging: false,
            progress_interval_chunks: 64,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    /// Set the handshake timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_await_receipt(mut self, await_receipt: bool) -> Self {
        self.await_receipt = await_receipt;
        self
    }

    pub fn with_progress_interval(mut self, chunks: u64) -> Self {
        self.progress_interval_chunks = chunks;
        self
    }

    /// Enable verbose logging
    pub fn with_verbose_logging(mut self) -> Self {
        self.verbose_logging = true;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Largest frame accepted from the peer.
    pub fn max_frame_size(&self) -> usize {
        (self.chunk_size_bytes + TRAILER_LEN + DATA_FRAME_OVERHEAD).max(HANDSHAKE_FRAME_LIMIT)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size_bytes) {
            return Err(ChannelError::InvalidConfig(format!(
                "chunk_size_bytes must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE}, got {}",
                self.chunk_size_bytes
            )));
        }
        if self.kem_algorithm != ML_KEM_ALGORITHM {
            return Err(ChannelError::InvalidConfig(format!(
                "unsupported kem_algorithm {:?}, expected {ML_KEM_ALGORITHM}",
                self.kem_algorithm
            )));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ChannelError::InvalidConfig(
                "handshake_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
