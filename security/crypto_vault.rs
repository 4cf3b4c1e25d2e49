//! Field Encryption
//!
//! Seals sensitive personal fields (tax ids and similar) with AES-256-GCM
//! under one process-wide key injected at construction.
//!
//! Stored layout: `base64(nonce || ciphertext || tag)`, standard alphabet,
//! padded. The nonce is 12 random bytes drawn from the OS for every call.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::error::{Result, SecurityError};

/// AES-GCM nonce size in bytes
pub const NONCE_LEN: usize = 12;

/// AES-GCM tag size in bytes
pub const TAG_LEN: usize = 16;

/// Vault configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Encrypt PII fields before they reach storage. When disabled the
    /// protected fields are dropped instead of stored.
    pub pii_encryption_enabled: bool,

    /// 32-byte key as 64 hex chars, base64, or a raw 32-char string
    pub key: Option<String>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            pii_encryption_enabled: true,
            key: None,
        }
    }
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("pii_encryption_enabled", &self.pii_encryption_enabled)
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Ciphertext of one sensitive field, text-encoded for storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncryptedBlob(String);

impl EncryptedBlob {
    /// Wrap a value read back from storage
    pub fn from_stored(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encoded text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the encoded text
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for EncryptedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Symmetric authenticated encryption of sensitive fields
#[derive(Clone)]
pub struct CryptoVault {
    cipher: Aes256Gcm,
    enabled: bool,
}

impl fmt::Debug for CryptoVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoVault")
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl CryptoVault {
    /// Create a vault over a 32-byte key
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
            enabled: true,
        }
    }

    /// Create a vault from configuration and already-resolved key material
    pub fn from_config(config: &VaultConfig, key: &[u8; 32]) -> Self {
        let mut vault = Self::new(key);
        vault.enabled = config.pii_encryption_enabled;
        if !vault.enabled {
            info!("PII encryption disabled: protected fields will not be persisted");
        }
        vault
    }

    /// Whether protected fields should be sealed and persisted
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Seal plaintext under a fresh random nonce
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecurityError::Encryption(e.to_string()))?;

        let mut data = Vec::with_capacity(NONCE_LEN + sealed.len());
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&sealed);

        Ok(EncryptedBlob(BASE64.encode(data)))
    }

    /// Open a blob; fails without output on short input or tag mismatch
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>> {
        let data = BASE64
            .decode(blob.as_str())
            .map_err(|e| SecurityError::Decryption(format!("Invalid encoding: {}", e)))?;

        if data.len() < NONCE_LEN {
            return Err(SecurityError::Decryption("Ciphertext too short".to_string()));
        }

        let (nonce, sealed) = data.split_at(NONCE_LEN);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SecurityError::Decryption("Authentication failed".to_string()))
    }

    /// Seal a UTF-8 field
    pub fn encrypt_str(&self, plaintext: &str) -> Result<EncryptedBlob> {
        self.encrypt(plaintext.as_bytes())
    }

    /// Open a UTF-8 field
    pub fn decrypt_str(&self, blob: &EncryptedBlob) -> Result<String> {
        let plaintext = self.decrypt(blob)?;
        String::from_utf8(plaintext)
            .map_err(|e| SecurityError::Decryption(format!("Invalid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CryptoVault {
        CryptoVault::new(&[42u8; 32])
    }

    #[test]
    fn test_round_trip() {
        let vault = vault();
        let blob = vault.encrypt_str("12.345.678/0001-90").unwrap();
        assert_ne!(blob.as_str(), "12.345.678/0001-90");
        assert_eq!(vault.decrypt_str(&blob).unwrap(), "12.345.678/0001-90");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let vault = vault();
        let a = BASE64.decode(vault.encrypt_str("same").unwrap().as_str()).unwrap();
        let b = BASE64.decode(vault.encrypt_str("same").unwrap().as_str()).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_eq!(a.len(), NONCE_LEN + "same".len() + TAG_LEN);
    }

    #[test]
    fn test_short_input_rejected() {
        let vault = vault();
        let blob = EncryptedBlob::from_stored(BASE64.encode([0u8; NONCE_LEN - 1]));
        assert!(matches!(
            vault.decrypt(&blob),
            Err(SecurityError::Decryption(_))
        ));
    }

    #[test]
    fn test_bad_encoding_rejected() {
        let blob = EncryptedBlob::from_stored("not base64 !!");
        assert!(vault().decrypt(&blob).is_err());
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let vault = vault();
        let mut raw = BASE64
            .decode(vault.encrypt_str("secret").unwrap().as_str())
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let blob = EncryptedBlob::from_stored(BASE64.encode(raw));
        assert!(vault.decrypt(&blob).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let blob = vault().encrypt_str("secret").unwrap();
        let other = CryptoVault::new(&[7u8; 32]);
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let config = VaultConfig {
            pii_encryption_enabled: true,
            key: Some("super-secret".to_string()),
        };
        assert!(!format!("{:?}", config).contains("super-secret"));
        assert!(!format!("{:?}", vault()).contains("42"));
    }
}
