//! Key store configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KeyStoreError, Result};

/// Argon2id cost parameters and rotation policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyStoreConfig {
    /// Argon2 t-cost
    pub kdf_iterations: u32,

    /// Argon2 m-cost in KiB
    pub kdf_memory_kib: u32,

    /// Argon2 lanes
    pub kdf_parallelism: u32,

    /// How long a rotated-out key stays loadable, in seconds
    pub key_rotation_grace_period_secs: u64,

    /// Append operations to `audit.jsonl` in the store directory
    pub audit_log: bool,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: 3,
            kdf_memory_kib: 19_456,
            kdf_parallelism: 1,
            key_rotation_grace_period_secs: 24 * 60 * 60,
            audit_log: true,
        }
    }
}

impl KeyStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kdf_params(mut self, memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        self.kdf_memory_kib = memory_kib;
        self.kdf_iterations = iterations;
        self.kdf_parallelism = parallelism;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.key_rotation_grace_period_secs = grace.as_secs();
        self
    }

    pub fn with_audit_log(mut self, enabled: bool) -> Self {
        self.audit_log = enabled;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.key_rotation_grace_period_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations == 0 {
            return Err(KeyStoreError::InvalidConfig(
                "kdf_iterations must be at least 1".into(),
            ));
        }
        if self.kdf_parallelism == 0 {
            return Err(KeyStoreError::InvalidConfig(
                "kdf_parallelism must be at least 1".into(),
            ));
        }
        // Argon2 needs 8 KiB per lane.
        let min_memory = self.kdf_parallelism.checked_mul(8).ok_or_else(|| {
            KeyStoreError::InvalidConfig(format!(
                "kdf_parallelism {} is out of range",
                self.kdf_parallelism
            ))
        })?;
        if self.kdf_memory_kib < min_memory {
            return Err(KeyStoreError::InvalidConfig(format!(
                "kdf_memory_kib must be at least {} for {} lanes",
                min_memory, self.kdf_parallelism
            )));
        }
        Ok(())
    }
}
