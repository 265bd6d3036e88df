//! SHA256 content digests
//!
//! [`Digest`] is the validated `sha256:<hex>` form used to address every blob
//! and manifest.

use crate::error::{RegistryError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Digest as _;
use std::fmt;
use std::str::FromStr;

/// Standard SHA256 digest of zero bytes
pub const EMPTY_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Content of a gzipped tar archive with no entries
pub const GZIPPED_EMPTY_LAYER: &[u8] = &[
    31, 139, 8, 0, 0, 9, 110, 136, 0, 255, 98, 24, 5, 163, 96, 20, 140, 88, 0, 8, 0, 0, 255, 255,
    46, 175, 181, 239, 0, 4, 0, 0,
];

/// Digest of [`GZIPPED_EMPTY_LAYER`]
pub const GZIPPED_EMPTY_LAYER_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// Diff ID of the empty layer (sha256 of 1024 zero bytes)
pub const EMPTY_LAYER_DIFF_ID: &str =
    "sha256:5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef";

const ALGORITHM: &str = "sha256";

/// An algorithm-prefixed content hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a `sha256:<64 hex>` string
    pub fn parse(value: &str) -> Result<Self> {
        let hex_part = value.strip_prefix("sha256:").ok_or_else(|| {
            RegistryError::Validation(format!("unsupported digest algorithm: {}", value))
        })?;
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RegistryError::Validation(format!(
                "invalid sha256 digest: {}",
                value
            )));
        }
        Ok(Digest(format!("{}:{}", ALGORITHM, hex_part.to_ascii_lowercase())))
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        Digest(format!("{}:{}", ALGORITHM, hex::encode(sha2::Sha256::digest(data))))
    }

    /// Build a digest from a finished hasher
    pub fn from_hasher(hasher: sha2::Sha256) -> Self {
        Digest(format!("{}:{}", ALGORITHM, hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn algorithm(&self) -> &str {
        ALGORITHM
    }

    /// The hex portion without the algorithm prefix
    pub fn hex(&self) -> &str {
        &self.0[ALGORITHM.len() + 1..]
    }

    /// Shortened form for progress output
    pub fn short(&self) -> &str {
        &self.hex()[..12]
    }

    /// Fail with an integrity error unless `actual` equals `self`
    pub fn verify(&self, actual: &Digest) -> Result<()> {
        if self != actual {
            return Err(RegistryError::DigestMismatch {
                expected: self.0.clone(),
                actual: actual.0.clone(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Digest::parse(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn empty_digest_matches_constant() {
        assert_eq!(Digest::from_bytes(b"").as_str(), EMPTY_DIGEST);
    }

    #[test]
    fn gzipped_empty_layer_is_consistent() {
        assert_eq!(
            Digest::from_bytes(GZIPPED_EMPTY_LAYER).as_str(),
            GZIPPED_EMPTY_LAYER_DIGEST
        );
        let mut content = Vec::new();
        GzDecoder::new(GZIPPED_EMPTY_LAYER)
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content.len(), 1024);
        assert_eq!(Digest::from_bytes(&content).as_str(), EMPTY_LAYER_DIFF_ID);
    }

    #[test]
    fn from_bytes_hashes_content() {
        assert_eq!(
            Digest::from_bytes(b"abc").hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            Digest::from_bytes(GZIPPED_EMPTY_LAYER).hex(),
            "a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4"
        );
    }

    #[test]
    fn parse_rejects_bad_digests() {
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse("sha256:xyz").is_err());
        let upper = format!("sha256:{}", "A".repeat(64));
        assert_eq!(Digest::parse(&upper).unwrap().hex(), "a".repeat(64));
    }

    #[test]
    fn verify_reports_mismatch() {
        let a = Digest::from_bytes(b"a");
        let b = Digest::from_bytes(b"b");
        assert!(a.verify(&a).is_ok());
        assert!(matches!(
            a.verify(&b),
            Err(RegistryError::DigestMismatch { .. })
        ));
    }
}
