//! Archive signing
//!
//! The signer receives the raw digest bytes of a staged archive and returns a
//! detached signature that travels with the archive as object metadata.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// A detached signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Identifier of the signing key
    pub key_id: String,
    /// Raw signature bytes
    pub bytes: Vec<u8>,
}

impl Signature {
    /// Base64 form, as stored in object metadata
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }

    /// Decode a base64 signature
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> GatewayResult<Self> {
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| GatewayError::InvalidData(format!("Invalid signature encoding: {}", e)))?;
        Ok(Self {
            key_id: key_id.into(),
            bytes,
        })
    }
}

/// Signing collaborator
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign a content digest
    async fn sign(&self, digest: &[u8]) -> GatewayResult<Signature>;
}

/// In-process Ed25519 signer
pub struct Ed25519Signer {
    key_id: String,
    key: SigningKey,
}

impl Ed25519Signer {
    /// Create a signer from a 32-byte seed
    pub fn from_seed(key_id: impl Into<String>, seed: [u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Create a signer from a hex-encoded 32-byte seed
    pub fn from_seed_hex(key_id: impl Into<String>, seed_hex: &str) -> GatewayResult<Self> {
        let seed = decode_seed(seed_hex)?;
        Ok(Self::from_seed(key_id, seed))
    }

    /// Public half of the key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Verify a signature produced by this signer
    pub fn verify(&self, digest: &[u8], signature: &Signature) -> bool {
        let Ok(bytes) = <[u8; 64]>::try_from(signature.bytes.as_slice()) else {
            return false;
        };
        let signature = ed25519_dalek::Signature::from_bytes(&bytes);
        self.key.verifying_key().verify(digest, &signature).is_ok()
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    async fn sign(&self, digest: &[u8]) -> GatewayResult<Signature> {
        if digest.is_empty() {
            return Err(GatewayError::Signing("Refusing to sign an empty digest".to_string()));
        }
        let signature = self.key.sign(digest);
        Ok(Signature {
            key_id: self.key_id.clone(),
            bytes: signature.to_bytes().to_vec(),
        })
    }
}

fn decode_seed(seed_hex: &str) -> GatewayResult<[u8; 32]> {
    let seed_hex = seed_hex.trim();
    if seed_hex.len() != 64 {
        return Err(GatewayError::Configuration(format!(
            "Signing seed must be 64 hex characters, got {}",
            seed_hex.len()
        )));
    }

    let mut seed = [0u8; 32];
    hex::decode_to_slice(seed_hex, &mut seed).map_err(|e| {
        GatewayError::Configuration(format!("Signing seed is not valid hex: {}", e))
    })?;
    Ok(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = "9d61b19deffd5a60ba844af492ec2cc44449c5697b326919703bac031cae7f60";

    #[tokio::test]
    async fn test_sign_and_verify() {
        let signer = Ed25519Signer::from_seed_hex("mirror-key", SEED).unwrap();
        let digest = [7u8; 32];
        let signature = signer.sign(&digest).await.unwrap();

        assert_eq!(signature.key_id, "mirror-key");
        assert_eq!(signature.bytes.len(), 64);
        assert!(signer.verify(&digest, &signature));
        assert!(!signer.verify(&[8u8; 32], &signature));
    }

    #[tokio::test]
    async fn test_signature_base64_round_trip() {
        let signer = Ed25519Signer::from_seed("k", [1u8; 32]);
        let signature = signer.sign(b"digest").await.unwrap();
        let decoded = Signature::from_base64("k", &signature.to_base64()).unwrap();
        assert_eq!(decoded, signature);
    }

    #[test]
    fn test_invalid_seed() {
        assert!(Ed25519Signer::from_seed_hex("k", "abcd").is_err());
        assert!(Ed25519Signer::from_seed_hex("k", &"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_non_ascii_seed_is_a_configuration_error() {
        // 64 bytes, but 'é' straddles a hex pair boundary
        let seed = format!("a\u{e9}{}", "0".repeat(61));
        assert_eq!(seed.len(), 64);

        let err = Ed25519Signer::from_seed_hex("k", &seed).unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_digest_rejected() {
        let signer = Ed25519Signer::from_seed("k", [1u8; 32]);
        assert!(signer.sign(&[]).await.is_err());
    }
}
