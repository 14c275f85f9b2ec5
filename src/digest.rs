//! Content digests
//!
//! Blobs are identified by the sha256 of their bytes, written in the
//! `sha256:<hex>` form used by OCI content stores.

use crate::error::{LayerkeepError, LayerkeepResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

const ALGORITHM: &str = "sha256";

/// Content hash uniquely identifying a blob
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Hash the given bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Hex-encoded hash without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0
    }

    /// Algorithm name
    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", ALGORITHM, self.0)
    }
}

impl FromStr for Digest {
    type Err = LayerkeepError;

    fn from_str(s: &str) -> LayerkeepResult<Self> {
        let (algo, encoded) = s
            .split_once(':')
            .ok_or_else(|| LayerkeepError::InvalidDigest(s.to_string()))?;

        if algo != ALGORITHM
            || encoded.len() != 64
            || !encoded.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(LayerkeepError::InvalidDigest(s.to_string()));
        }

        Ok(Self(encoded.to_string()))
    }
}

impl TryFrom<String> for Digest {
    type Error = LayerkeepError;

    fn try_from(value: String) -> LayerkeepResult<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_of_known_content() {
        let d = Digest::from_bytes(b"hello");
        assert_eq!(
            d.to_string(),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn parse_rejects_bad_input() {
        assert!("md5:abcd".parse::<Digest>().is_err());
        assert!("sha256:xyz".parse::<Digest>().is_err());
        assert!("no-colon".parse::<Digest>().is_err());
        assert!(format!("sha256:{}", "A".repeat(64)).parse::<Digest>().is_err());
    }

    #[test]
    fn parse_accepts_display_form() {
        let d = Digest::from_bytes(b"x");
        let parsed: Digest = d.to_string().parse().unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn serializes_as_prefixed_string() {
        let d = Digest::from_bytes(b"x");
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.starts_with("\"sha256:"));
    }
}
