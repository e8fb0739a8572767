//! Content digests
//!
//! Digests address registry blobs (`sha256:<hex>`) and identify whole
//! archives for signing. Both use the OCI `algorithm:hex` notation.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::{MirrorError, Result};

/// Supported hashing algorithms for content digests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-256 (the registry default)
    SHA256,
    /// SHA-512
    SHA512,
}

impl HashAlgorithm {
    /// Get the expected length of the hash in bytes
    pub fn hash_length(&self) -> usize {
        match self {
            HashAlgorithm::SHA256 => 32,
            HashAlgorithm::SHA512 => 64,
        }
    }

    /// Get the expected length of the hash in hexadecimal characters
    pub fn hex_length(&self) -> usize {
        self.hash_length() * 2
    }

    /// Prefix used in `algorithm:hex` notation
    pub fn prefix(&self) -> &'static str {
        match self {
            HashAlgorithm::SHA256 => "sha256",
            HashAlgorithm::SHA512 => "sha512",
        }
    }

    /// Validate that a hash string has the correct length for this algorithm
    pub fn validate_hash_format(&self, hash: &str) -> Result<()> {
        if hash.len() != self.hex_length() {
            return Err(MirrorError::Validation(format!(
                "Invalid hash length for {}: expected {} characters, got {}",
                self,
                self.hex_length(),
                hash.len()
            )));
        }

        // Registry digests are lowercase by definition
        if !hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(MirrorError::Validation(
                "Invalid hash format: must be lowercase hexadecimal".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::SHA256
    }
}

impl FromStr for HashAlgorithm {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(HashAlgorithm::SHA256),
            "sha512" => Ok(HashAlgorithm::SHA512),
            _ => Err(MirrorError::Validation(format!(
                "Unsupported digest algorithm: {}",
                s
            ))),
        }
    }
}

/// A content digest in `algorithm:hex` form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: HashAlgorithm,
    value: String,
}

impl Digest {
    /// Create a digest with validation
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        algorithm.validate_hash_format(&value)?;
        Ok(Self { algorithm, value })
    }

    /// Parse `algorithm:hex`
    pub fn parse(s: &str) -> Result<Self> {
        let (algorithm, value) = s
            .split_once(':')
            .ok_or_else(|| MirrorError::Validation(format!("Invalid digest: {}", s)))?;
        Self::new(algorithm.parse()?, value)
    }

    /// Compute the SHA-256 digest of a byte slice
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = DigestHasher::new(HashAlgorithm::SHA256);
        hasher.update(data);
        hasher.finalize()
    }

    /// The hashing algorithm used
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// The hexadecimal hash value
    pub fn hex(&self) -> &str {
        &self.value
    }

    /// Raw digest bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        hex::decode(&self.value)
            .map_err(|e| MirrorError::Validation(format!("Invalid digest {}: {}", self, e)))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl FromStr for Digest {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self> {
        Digest::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Incremental digest computation over streamed content
pub struct DigestHasher {
    inner: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestHasher {
    /// Start hashing with the given algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let inner = match algorithm {
            HashAlgorithm::SHA256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::SHA512 => HasherState::Sha512(Sha512::new()),
        };
        Self { inner }
    }

    /// Feed more content
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherState::Sha256(h) => h.update(data),
            HasherState::Sha512(h) => h.update(data),
        }
    }

    /// Finish and produce the digest
    pub fn finalize(self) -> Digest {
        let (algorithm, value) = match self.inner {
            HasherState::Sha256(h) => (HashAlgorithm::SHA256, hex::encode(h.finalize())),
            HasherState::Sha512(h) => (HashAlgorithm::SHA512, hex::encode(h.finalize())),
        };
        Digest { algorithm, value }
    }
}

impl fmt::Debug for DigestHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let algorithm = match self.inner {
            HasherState::Sha256(_) => HashAlgorithm::SHA256,
            HasherState::Sha512(_) => HashAlgorithm::SHA512,
        };
        f.debug_struct("DigestHasher").field("algorithm", &algorithm).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_hash_algorithm_lengths() {
        assert_eq!(HashAlgorithm::SHA256.hex_length(), 64);
        assert_eq!(HashAlgorithm::SHA512.hex_length(), 128);
    }

    #[test]
    fn test_digest_parse() {
        let digest = Digest::parse(&format!("sha256:{}", EMPTY_SHA256)).unwrap();
        assert_eq!(digest.algorithm(), HashAlgorithm::SHA256);
        assert_eq!(digest.hex(), EMPTY_SHA256);
        assert_eq!(digest.to_string(), format!("sha256:{}", EMPTY_SHA256));
    }

    #[test]
    fn test_digest_invalid() {
        assert!(Digest::parse("not_a_digest").is_err());
        assert!(Digest::parse("md5:abcd").is_err());
        assert!(Digest::parse(&format!("sha256:{}", "A".repeat(64))).is_err());
        assert!(Digest::parse(&format!("sha256:{}", "a".repeat(63))).is_err());
    }

    #[test]
    fn test_digest_of_empty_input() {
        assert_eq!(Digest::sha256(b"").hex(), EMPTY_SHA256);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = DigestHasher::new(HashAlgorithm::SHA256);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), Digest::sha256(b"hello world"));
    }

    #[test]
    fn test_to_bytes() {
        let digest = Digest::sha256(b"hello world");
        let bytes = digest.to_bytes().unwrap();
        assert_eq!(bytes.len(), 32);
        assert_eq!(bytes[0], 0xb9);
        assert_eq!(hex::encode(&bytes), digest.hex());
    }
}
