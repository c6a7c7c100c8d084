//! `pqxfer` configuration file.
//!
//! ```toml
//! key_dir = "/var/lib/pqxfer/keys"
//!
//! [channel]
//! chunk_size_bytes = 1048576
//! handshake_timeout_ms = 30000
//! await_receipt = true
//! progress_interval_chunks = 64
//!
//! [keystore]
//! kdf_iterations = 3
//! kdf_memory_kib = 19456
//! key_rotation_grace_period_secs = 86400
//! ```
//!
//! Every section and field is optional.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pq_channel::ChannelConfig;
use pq_keystore::KeyStoreConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_KEY_DIR: &str = ".pqxfer/keys";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub key_dir: Option<PathBuf>,
    pub channel: ChannelConfig,
    pub keystore: KeyStoreConfig,
}

impl FileConfig {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading configuration");
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        self.keystore.validate()?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// The configured key directory unless `cli` overrides it.
    pub fn key_dir(&self, cli: Option<&Path>) -> PathBuf {
        cli.map(Path::to_path_buf)
            .or_else(|| self.key_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_DIR))
    }
}
