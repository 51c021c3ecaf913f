//! HMAC-SHA256 envelope signing.
//!
//! When the controller is started with an exec key, every envelope carries a
//! hex digest over its four JSON sections; peers verify before parsing.
//! Verification uses the hmac crate's constant-time comparison.

use std::path::Path;

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Shared signing key loaded from the exec key file.
#[derive(Clone)]
pub struct SigningKey(Vec<u8>);

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SigningKey(..)")
    }
}

impl SigningKey {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self(material.into())
    }

    /// Load key material from a file, trimming trailing whitespace.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read exec key {}", path.display()))?;
        let trimmed = raw
            .strip_suffix(b"\n")
            .or_else(|| raw.strip_suffix(b"\r\n"))
            .unwrap_or(&raw);
        Ok(Self(trimmed.to_vec()))
    }

    /// Generate a fresh random key and write it hex-encoded to `path`.
    pub fn generate_to(path: &Path) -> Result<Self> {
        let mut material = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut material);
        let encoded = hex::encode(material);
        std::fs::write(path, &encoded)
            .with_context(|| format!("failed to write exec key {}", path.display()))?;
        Ok(Self(encoded.into_bytes()))
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.0).expect("hmac accepts any key length")
    }

    /// Hex digest over the envelope sections, in order.
    pub fn sign(&self, parts: &[&[u8]]) -> String {
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time verification of a hex signature.
    pub fn verify(&self, parts: &[&[u8]], signature: &[u8]) -> bool {
        let Ok(decoded) = hex::decode(signature) else {
            return false;
        };
        let mut mac = self.mac();
        for part in parts {
            mac.update(part);
        }
        mac.verify_slice(&decoded).is_ok()
    }
}
