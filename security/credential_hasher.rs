//! Password Hashing
//!
//! Argon2id with explicit, configurable cost parameters. Records are stored
//! as a self-describing text string:
//!
//! ```text
//! $argon2id$v=19$m=65536,t=1,p=4$<salt b64>$<digest b64>
//! ```
//!
//! Records from the first deployment (`<salt hex>:<digest hex>`) are still
//! accepted and verified with the fixed parameters that deployment used.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD_NO_PAD as B64, Engine};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

use crate::error::{Result, SecurityError};

const ALGORITHM_TAG: &str = "argon2id";
const VERSION_TAG: &str = "v=19";

// Upper bounds accepted when parsing stored records, so a corrupted row
// cannot make verification allocate unbounded memory.
const MAX_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_TIME_COST: u32 = 64;
const MAX_PARALLELISM: u32 = 64;
const MIN_SALT_LEN: usize = 8;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashParams {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,

    /// Number of passes
    pub time_cost: u32,

    /// Lanes
    pub parallelism: u32,
}

impl HashParams {
    /// Parameters of the first deployment's `salt:digest` records
    pub const LEGACY: HashParams = HashParams {
        memory_cost_kib: 64 * 1024,
        time_cost: 1,
        parallelism: 4,
    };

    fn is_weaker_than(&self, other: &HashParams) -> bool {
        self.memory_cost_kib < other.memory_cost_kib
            || self.time_cost < other.time_cost
            || self.parallelism < other.parallelism
    }

    fn within_bounds(&self) -> bool {
        self.memory_cost_kib <= MAX_MEMORY_KIB
            && (1..=MAX_TIME_COST).contains(&self.time_cost)
            && (1..=MAX_PARALLELISM).contains(&self.parallelism)
    }
}

/// Hasher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HasherConfig {
    /// Memory cost in KiB
    pub memory_cost_kib: u32,

    /// Number of passes
    pub time_cost: u32,

    /// Lanes
    pub parallelism: u32,

    /// Digest length in bytes
    pub output_len: usize,

    /// Salt length in bytes
    pub salt_len: usize,
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            memory_cost_kib: 64 * 1024, // 64 MiB
            time_cost: 1,
            parallelism: 4,
            output_len: 32,
            salt_len: 16,
        }
    }
}

impl HasherConfig {
    /// Cost parameters from this configuration
    pub fn params(&self) -> HashParams {
        HashParams {
            memory_cost_kib: self.memory_cost_kib,
            time_cost: self.time_cost,
            parallelism: self.parallelism,
        }
    }

    /// Check the parameters against the algorithm's limits
    pub fn validate(&self) -> Result<()> {
        if self.salt_len < MIN_SALT_LEN {
            return Err(SecurityError::Config(format!(
                "Salt must be at least {} bytes",
                MIN_SALT_LEN
            )));
        }
        if !self.params().within_bounds() {
            return Err(SecurityError::Config(
                "Argon2 cost parameters out of range".to_string(),
            ));
        }
        Params::new(
            self.memory_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(self.output_len),
        )
        .map(|_| ())
        .map_err(|e| SecurityError::Config(format!("Invalid Argon2 parameters: {}", e)))
    }
}

/// Stored password representation
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordRecord {
    params: HashParams,
    salt: Vec<u8>,
    digest: Vec<u8>,
    legacy: bool,
}

impl PasswordRecord {
    /// Cost parameters the record was produced with
    pub fn params(&self) -> HashParams {
        self.params
    }

    /// Salt bytes
    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// Whether the record uses the first deployment's format
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Encode for storage
    pub fn encode(&self) -> String {
        if self.legacy {
            return format!("{}:{}", hex::encode(&self.salt), hex::encode(&self.digest));
        }
        format!(
            "${}${}$m={},t={},p={}${}${}",
            ALGORITHM_TAG,
            VERSION_TAG,
            self.params.memory_cost_kib,
            self.params.time_cost,
            self.params.parallelism,
            B64.encode(&self.salt),
            B64.encode(&self.digest),
        )
    }

    /// Parse a stored record
    pub fn parse(encoded: &str) -> Result<Self> {
        if encoded.starts_with('$') {
            Self::parse_phc(encoded)
        } else {
            Self::parse_legacy(encoded)
        }
    }

    fn parse_phc(encoded: &str) -> Result<Self> {
        let malformed = |what: &str| SecurityError::Hashing(format!("Malformed record: {}", what));

        let parts: Vec<&str> = encoded.split('$').collect();
        // Leading '$' yields an empty first part
        if parts.len() != 6 || !parts[0].is_empty() {
            return Err(malformed("field count"));
        }
        if parts[1] != ALGORITHM_TAG {
            return Err(malformed("algorithm"));
        }
        if parts[2] != VERSION_TAG {
            return Err(malformed("version"));
        }

        let mut memory = None;
        let mut time = None;
        let mut lanes = None;
        for pair in parts[3].split(',') {
            let (name, value) = pair.split_once('=').ok_or_else(|| malformed("parameters"))?;
            let value: u32 = value.parse().map_err(|_| malformed("parameters"))?;
            match name {
                "m" => memory = Some(value),
                "t" => time = Some(value),
                "p" => lanes = Some(value),
                _ => return Err(malformed("parameters")),
            }
        }
        let params = HashParams {
            memory_cost_kib: memory.ok_or_else(|| malformed("memory cost"))?,
            time_cost: time.ok_or_else(|| malformed("time cost"))?,
            parallelism: lanes.ok_or_else(|| malformed("parallelism"))?,
        };
        if !params.within_bounds() {
            return Err(malformed("parameters out of range"));
        }

        let salt = B64.decode(parts[4]).map_err(|_| malformed("salt"))?;
        let digest = B64.decode(parts[5]).map_err(|_| malformed("digest"))?;
        if salt.len() < MIN_SALT_LEN || digest.is_empty() {
            return Err(malformed("length"));
        }

        Ok(Self {
            params,
            salt,
            digest,
            legacy: false,
        })
    }

    fn parse_legacy(encoded: &str) -> Result<Self> {
        let malformed = |what: &str| SecurityError::Hashing(format!("Malformed record: {}", what));

        let parts: Vec<&str> = encoded.split(':').collect();
        if parts.len() != 2 {
            return Err(malformed("field count"));
        }
        let salt = hex::decode(parts[0]).map_err(|_| malformed("salt"))?;
        let digest = hex::decode(parts[1]).map_err(|_| malformed("digest"))?;
        if salt.len() < MIN_SALT_LEN || digest.is_empty() {
            return Err(malformed("length"));
        }

        Ok(Self {
            params: HashParams::LEGACY,
            salt,
            digest,
            legacy: true,
        })
    }
}

impl fmt::Display for PasswordRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl fmt::Debug for PasswordRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordRecord")
            .field("params", &self.params)
            .field("legacy", &self.legacy)
            .finish_non_exhaustive()
    }
}

impl FromStr for PasswordRecord {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// One-way password hashing and verification
#[derive(Debug, Clone)]
pub struct CredentialHasher {
    config: HasherConfig,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            config: HasherConfig::default(),
        }
    }
}

impl CredentialHasher {
    /// Create a hasher; fails on parameters Argon2 rejects
    pub fn new(config: HasherConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Active configuration
    pub fn config(&self) -> &HasherConfig {
        &self.config
    }

    /// Hash a password under a fresh random salt
    pub fn hash(&self, password: &str) -> Result<PasswordRecord> {
        let mut salt = vec![0u8; self.config.salt_len];
        OsRng.fill_bytes(&mut salt);

        let params = self.config.params();
        let digest = derive(password.as_bytes(), &salt, &params, self.config.output_len)?;

        Ok(PasswordRecord {
            params,
            salt,
            digest,
            legacy: false,
        })
    }

    /// Recompute the digest under the record's salt and parameters and
    /// compare in constant time
    pub fn verify(&self, password: &str, record: &PasswordRecord) -> bool {
        match derive(
            password.as_bytes(),
            &record.salt,
            &record.params,
            record.digest.len(),
        ) {
            Ok(candidate) => candidate.ct_eq(&record.digest).into(),
            Err(_) => false,
        }
    }

    /// Verify against a stored string; malformed records never verify
    pub fn verify_encoded(&self, password: &str, encoded: &str) -> bool {
        match PasswordRecord::parse(encoded) {
            Ok(record) => self.verify(password, &record),
            Err(_) => false,
        }
    }

    /// Whether the record should be replaced with a fresh hash
    pub fn needs_rehash(&self, record: &PasswordRecord) -> bool {
        record.legacy
            || record.params.is_weaker_than(&self.config.params())
            || record.digest.len() < self.config.output_len
            || record.salt.len() < self.config.salt_len
    }
}

fn derive(password: &[u8], salt: &[u8], params: &HashParams, output_len: usize) -> Result<Vec<u8>> {
    let params = Params::new(
        params.memory_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(output_len),
    )
    .map_err(|e| SecurityError::Hashing(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = vec![0u8; output_len];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|e| SecurityError::Hashing(e.to_string()))?;
    Ok(out)
}
