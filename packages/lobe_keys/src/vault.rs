//! Pluggable strategies applied to key material before it is stored or after
//! it is read back.
//!
//! Lookups by key encrypt the candidate and compare ciphertexts, so an
//! [`Encryptor`] used for storage must be deterministic.

use async_trait::async_trait;
use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

use crate::error::KeyError;

#[async_trait]
pub trait Encryptor: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String, KeyError>;
}

#[async_trait]
pub trait Decryptor: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, KeyError>;
}

/// Stores keys verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughVault;

#[async_trait]
impl Encryptor for PassthroughVault {
    async fn encrypt(&self, plaintext: &str) -> Result<String, KeyError> {
        Ok(plaintext.to_string())
    }
}

#[async_trait]
impl Decryptor for PassthroughVault {
    async fn decrypt(&self, ciphertext: &str) -> Result<String, KeyError> {
        Ok(ciphertext.to_string())
    }
}

/// One-way SHA-256 digest of `pepper || key`, hex encoded.
///
/// The plaintext is only visible to the caller at creation time.
#[derive(Clone)]
pub struct DigestEncryptor {
    pepper: Vec<u8>,
}

impl DigestEncryptor {
    pub const PREFIX: &'static str = "sha256:";

    pub fn new(pepper: impl Into<Vec<u8>>) -> Self {
        Self {
            pepper: pepper.into(),
        }
    }

    pub fn digest(&self, plaintext: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.pepper);
        hasher.update(plaintext.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        format!("{}{}", Self::PREFIX, HEXLOWER.encode(&digest))
    }
}

impl std::fmt::Debug for DigestEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestEncryptor")
            .field("pepper", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl Encryptor for DigestEncryptor {
    async fn encrypt(&self, plaintext: &str) -> Result<String, KeyError> {
        Ok(self.digest(plaintext))
    }
}

#[async_trait]
impl Decryptor for DigestEncryptor {
    async fn decrypt(&self, _ciphertext: &str) -> Result<String, KeyError> {
        Err(KeyError::DecryptionUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_is_identity() {
        let vault = PassthroughVault;
        let enc = vault.encrypt("lb-0123456789abcdef").await.unwrap();
        assert_eq!(enc, "lb-0123456789abcdef");
        assert_eq!(vault.decrypt(&enc).await.unwrap(), enc);
    }

    #[tokio::test]
    async fn digest_is_deterministic_and_peppered() {
        let a = DigestEncryptor::new("pepper-a");
        let b = DigestEncryptor::new("pepper-b");

        let first = a.encrypt("lb-0123456789abcdef").await.unwrap();
        let second = a.encrypt("lb-0123456789abcdef").await.unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("sha256:"));
        assert_eq!(first.len(), "sha256:".len() + 64);

        let other = b.encrypt("lb-0123456789abcdef").await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn digest_cannot_decrypt() {
        let vault = DigestEncryptor::new("p");
        let err = vault.decrypt("sha256:00").await.unwrap_err();
        assert_eq!(err, KeyError::DecryptionUnsupported);
    }

    #[test]
    fn debug_redacts_pepper() {
        let vault = DigestEncryptor::new("super-secret");
        assert!(!format!("{vault:?}").contains("super-secret"));
    }
}
