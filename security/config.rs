//! Security configuration
//!
//! One serde-deserializable tree holding every component's policy, plus the
//! resolution of key material into the byte forms the components take.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::audit::AuditConfig;
use crate::credential_hasher::HasherConfig;
use crate::crypto_vault::VaultConfig;
use crate::error::{Result, SecurityError};
use crate::rate_limiter::RateLimiterConfig;
use crate::token_issuer::{TokenConfig, MIN_SECRET_LEN};

/// AES-256 key length in bytes
pub const VAULT_KEY_LEN: usize = 32;

#[cfg(not(feature = "production"))]
const DEV_VAULT_KEY: &[u8; VAULT_KEY_LEN] = b"12345678901234567890123456789012";

#[cfg(not(feature = "production"))]
const DEV_TOKEN_SECRET: &[u8] = b"insecure-development-token-secret-change-me";

/// Security policy for all components
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Fall back to built-in development keys when key material is missing
    /// or malformed. Rejected in `production` builds.
    pub allow_insecure_dev_key: bool,

    /// Field encryption
    pub vault: VaultConfig,

    /// Password hashing
    pub hasher: HasherConfig,

    /// Login throttling
    pub rate_limiter: RateLimiterConfig,

    /// Session tokens
    pub token: TokenConfig,

    /// Audit recording
    pub audit: AuditConfig,
}

/// Key material in the form the components take
#[derive(Clone)]
pub struct ResolvedKeys {
    /// AES-256 key for the vault
    pub vault_key: [u8; VAULT_KEY_LEN],

    /// HMAC secret for tokens
    pub token_secret: Vec<u8>,

    /// True if any development key was substituted
    pub insecure: bool,
}

impl fmt::Debug for ResolvedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedKeys")
            .field("vault_key", &"[REDACTED]")
            .field("token_secret", &"[REDACTED]")
            .field("insecure", &self.insecure)
            .finish()
    }
}

impl SecurityConfig {
    /// Reject inconsistent policy
    pub fn validate(&self) -> Result<()> {
        self.hasher.validate()?;
        self.rate_limiter.validate()?;
        self.token.validate()?;
        self.audit.validate()?;

        if cfg!(feature = "production") && self.allow_insecure_dev_key {
            return Err(SecurityError::Config(
                "allow_insecure_dev_key is not available in production builds".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode the vault key and token secret
    pub fn resolve_keys(&self) -> Result<ResolvedKeys> {
        let mut insecure = false;

        let parsed = match self.vault.key.as_deref() {
            Some(encoded) => parse_vault_key(encoded),
            None => Err(SecurityError::Config("Vault key is not set".to_string())),
        };
        let vault_key = match parsed {
            Ok(key) => key,
            Err(err) => {
                insecure = true;
                self.dev_vault_key(err)?
            }
        };

        let token_secret = match self.token.secret.as_deref() {
            Some(secret) if secret.len() >= MIN_SECRET_LEN => secret.as_bytes().to_vec(),
            Some(_) => {
                insecure = true;
                self.dev_token_secret(SecurityError::Config(format!(
                    "Token secret must be at least {} bytes",
                    MIN_SECRET_LEN
                )))?
            }
            None => {
                insecure = true;
                self.dev_token_secret(SecurityError::Config(
                    "Token secret is not set".to_string(),
                ))?
            }
        };

        Ok(ResolvedKeys {
            vault_key,
            token_secret,
            insecure,
        })
    }

    fn dev_vault_key(&self, err: SecurityError) -> Result<[u8; VAULT_KEY_LEN]> {
        #[cfg(not(feature = "production"))]
        {
            if self.allow_insecure_dev_key {
                warn!(
                    "{}; using the built-in development vault key. NOT FOR PRODUCTION",
                    err
                );
                return Ok(*DEV_VAULT_KEY);
            }
        }
        Err(err)
    }

    fn dev_token_secret(&self, err: SecurityError) -> Result<Vec<u8>> {
        #[cfg(not(feature = "production"))]
        {
            if self.allow_insecure_dev_key {
                warn!(
                    "{}; using the built-in development token secret. NOT FOR PRODUCTION",
                    err
                );
                return Ok(DEV_TOKEN_SECRET.to_vec());
            }
        }
        Err(err)
    }
}

/// Decode a 32-byte key from 64 hex chars, base64, or a raw 32-char string
pub fn parse_vault_key(encoded: &str) -> Result<[u8; VAULT_KEY_LEN]> {
    let encoded = encoded.trim();

    let bytes = if encoded.len() == VAULT_KEY_LEN * 2 {
        hex::decode(encoded).ok()
    } else {
        None
    }
    .or_else(|| {
        BASE64
            .decode(encoded)
            .ok()
            .filter(|b| b.len() == VAULT_KEY_LEN)
    })
    .unwrap_or_else(|| encoded.as_bytes().to_vec());

    bytes.try_into().map_err(|b: Vec<u8>| {
        SecurityError::Config(format!(
            "Vault key must be {} bytes, got {}",
            VAULT_KEY_LEN,
            b.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed() -> SecurityConfig {
        let mut config = SecurityConfig::default();
        config.vault.key = Some("ab".repeat(32));
        config.token.secret = Some("s".repeat(40));
        config
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SecurityConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.vault.pii_encryption_enabled);
        assert_eq!(config.rate_limiter.max_attempts, 5);
        assert_eq!(config.token.effective_ttl_secs(), 900);
        assert_eq!(config.audit.queue_capacity, 1024);
    }

    #[test]
    fn test_key_formats() {
        assert_eq!(parse_vault_key(&"ab".repeat(32)).unwrap(), [0xab; 32]);
        assert_eq!(parse_vault_key(&BASE64.encode([7u8; 32])).unwrap(), [7; 32]);
        assert_eq!(
            parse_vault_key("12345678901234567890123456789012").unwrap(),
            *b"12345678901234567890123456789012"
        );
        assert!(parse_vault_key("too-short").is_err());
    }

    #[test]
    fn test_resolve_configured_keys() {
        let keys = keyed().resolve_keys().unwrap();
        assert_eq!(keys.vault_key, [0xab; 32]);
        assert_eq!(keys.token_secret.len(), 40);
        assert!(!keys.insecure);
        assert!(!format!("{:?}", keys).contains("ssss"));
    }

    #[test]
    fn test_missing_keys_fail_without_opt_in() {
        let mut config = keyed();
        config.vault.key = None;
        assert!(matches!(
            config.resolve_keys(),
            Err(SecurityError::Config(_))
        ));

        let mut config = keyed();
        config.token.secret = Some("short".to_string());
        assert!(config.resolve_keys().is_err());
    }

    #[cfg(not(feature = "production"))]
    #[test]
    fn test_dev_key_fallback() {
        let config = SecurityConfig {
            allow_insecure_dev_key: true,
            ..SecurityConfig::default()
        };
        let keys = config.resolve_keys().unwrap();
        assert!(keys.insecure);
        assert_eq!(&keys.vault_key, DEV_VAULT_KEY);
        assert!(keys.token_secret.len() >= MIN_SECRET_LEN);
    }

    #[test]
    fn test_inconsistent_policy_rejected() {
        let mut config = SecurityConfig::default();
        config.token.refresh_threshold_secs = 900;
        assert!(config.validate().is_err());

        let mut config = SecurityConfig::default();
        config.audit.queue_capacity = 0;
        assert!(config.validate().is_err());
    }
}
