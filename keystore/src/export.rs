//! Text encodings for sharing public identity keys.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use crypto::identity::{IdentityPublicKey, IDENTITY_ALGORITHM};
use crypto::traits::VerifyKey;
use serde::{Deserialize, Serialize};

use crate::error::{KeyStoreError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicKeyFormat {
    /// Base64 between `-----BEGIN ED25519 PUBLIC KEY-----` armor lines
    #[default]
    Pem,
    /// Bare base64
    Raw,
    Hex,
}

impl FromStr for PublicKeyFormat {
    type Err = KeyStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pem" => Ok(PublicKeyFormat::Pem),
            "raw" | "base64" => Ok(PublicKeyFormat::Raw),
            "hex" => Ok(PublicKeyFormat::Hex),
            other => Err(KeyStoreError::InvalidEncoding(format!(
                "unknown format {other:?}"
            ))),
        }
    }
}

impl fmt::Display for PublicKeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublicKeyFormat::Pem => "pem",
            PublicKeyFormat::Raw => "raw",
            PublicKeyFormat::Hex => "hex",
        })
    }
}

fn armor_label() -> String {
    format!("{} PUBLIC KEY", IDENTITY_ALGORITHM.to_ascii_uppercase())
}

pub fn encode_public(key: &IdentityPublicKey, format: PublicKeyFormat) -> String {
    match format {
        PublicKeyFormat::Pem => {
            let label = armor_label();
            format!(
                "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
                STANDARD.encode(key.as_bytes())
            )
        }
        PublicKeyFormat::Raw => STANDARD.encode(key.as_bytes()),
        PublicKeyFormat::Hex => hex::encode(key.as_bytes()),
    }
}

pub fn parse_public(text: &str, format: PublicKeyFormat) -> Result<IdentityPublicKey> {
    let bytes = match format {
        PublicKeyFormat::Pem => {
            let label = armor_label();
            let body = text
                .trim()
                .strip_prefix(&format!("-----BEGIN {label}-----"))
                .and_then(|rest| rest.trim_end().strip_suffix(&format!("-----END {label}-----")))
                .ok_or_else(|| KeyStoreError::InvalidEncoding("missing PEM armor".into()))?;
            let b64: String = body.split_whitespace().collect();
            STANDARD
                .decode(b64)
                .map_err(|e| KeyStoreError::InvalidEncoding(e.to_string()))?
        }
        PublicKeyFormat::Raw => STANDARD
            .decode(text.trim())
            .map_err(|e| KeyStoreError::InvalidEncoding(e.to_string()))?,
        PublicKeyFormat::Hex => hex::decode(text.trim())
            .map_err(|e| KeyStoreError::InvalidEncoding(e.to_string()))?,
    };
    Ok(IdentityPublicKey::from_bytes(&bytes)?)
}
