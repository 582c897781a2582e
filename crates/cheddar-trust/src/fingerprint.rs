//! SHA-256 certificate fingerprints.
//!
//! Fingerprints come from two places: computed in-process over the DER bytes of
//! the on-disk CA file, or parsed from what a store tool already printed. Both
//! are normalized to uppercase hex without separators so they compare equal.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, TrustError};

/// Normalized SHA-256 fingerprint (uppercase hex, no separators).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Parses a fingerprint, ignoring case, colons and whitespace.
    ///
    /// Returns `None` for empty input, odd length or non-hex characters.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized: String = raw
            .chars()
            .filter(|c| *c != ':' && !c.is_whitespace())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.is_empty()
            || normalized.len() % 2 != 0
            || !normalized.chars().all(|c| c.is_ascii_hexdigit())
        {
            return None;
        }
        Some(Self(normalized))
    }

    /// Fingerprint of raw DER bytes.
    pub fn of_der(der: &[u8]) -> Self {
        let digest = Sha256::digest(der);
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest.iter() {
            hex.push_str(&format!("{:02X}", byte));
        }
        Self(hex)
    }

    /// Returns the normalized hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares against a raw, possibly unnormalized fingerprint string.
    pub fn matches(&self, raw: &str) -> bool {
        Self::parse(raw).is_some_and(|other| other == *self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Computes the fingerprint of a PEM or DER certificate file.
pub async fn of_file(path: &Path) -> Result<Fingerprint> {
    let bytes = tokio::fs::read(path).await?;
    of_bytes(&bytes)
}

/// Computes the fingerprint of PEM or DER certificate bytes.
///
/// For PEM input the first `CERTIFICATE` block is used.
pub fn of_bytes(bytes: &[u8]) -> Result<Fingerprint> {
    if !bytes.windows(10).any(|w| w == b"-----BEGIN") {
        if bytes.is_empty() {
            return Err(TrustError::ParseFailure("empty certificate file".into()));
        }
        return Ok(Fingerprint::of_der(bytes));
    }

    let blocks = pem::parse_many(bytes).map_err(|e| TrustError::ParseFailure(e.to_string()))?;
    blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .map(|block| Fingerprint::of_der(block.contents()))
        .ok_or_else(|| TrustError::ParseFailure("no CERTIFICATE block in PEM".into()))
}

/// Extracts the fingerprint a trust-store query tool already printed.
///
/// Understands `SHA-256 hash: <hex>` (keychain), `Cert Hash(sha256): <hex>`
/// (certificate store) and the variant where the hex sits on the line after
/// the label.
pub fn of_store_entry(raw_tool_output: &str) -> Option<Fingerprint> {
    find_sha256(raw_tool_output)
}

/// Extracts a fingerprint from `label=hex` output of a `-sha256` fingerprint
/// tool, e.g. `sha256 Fingerprint=AA:BB:...`.
pub fn from_tool_output(output: &str) -> Option<Fingerprint> {
    find_sha256(output)
}

fn find_sha256(output: &str) -> Option<Fingerprint> {
    let lines: Vec<&str> = output.lines().collect();

    for (index, line) in lines.iter().enumerate() {
        let lower = line.to_ascii_lowercase();
        let Some(label_at) = lower.find("sha-256").or_else(|| lower.find("sha256")) else {
            continue;
        };

        let after_label = &line[label_at..];
        if let Some(sep) = after_label.find([':', '=']) {
            let value = &after_label[sep + 1..];
            if let Some(fp) = Fingerprint::parse(value) {
                return Some(fp);
            }
        }

        if let Some(next) = lines.get(index + 1) {
            if let Some(fp) = Fingerprint::parse(next) {
                return Some(fp);
            }
        }
    }
    None
}
