//! Security Core for Titan
//!
//! Session security and credential protection for the multi-tenant
//! back-office platform:
//! - Field encryption for personal data at rest
//! - Password hashing and verification
//! - Login throttling
//! - Session token issue, validation and refresh
//! - Asynchronous audit recording with risk classification
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Security Core                      │
//! ├─────────────────────────────────────────────────────┤
//! │  CryptoVault  │  CredentialHasher  │  RateLimiter   │
//! │  TokenIssuer  │  AuditRecorder                      │
//! └─────────────────────────────────────────────────────┘
//!                          ↓
//! ┌─────────────────────────────────────────────────────┐
//! │                  Edge Services                       │
//! │  Auth Gateway (register │ login │ session routes)   │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! ## Field Encryption (`crypto_vault`)
//! - AES-256-GCM with a fresh random nonce per call
//! - `base64(nonce || ciphertext || tag)` storage format
//! - Tampering detected by the authentication tag
//!
//! ## Password Hashing (`credential_hasher`)
//! - Argon2id with configurable cost
//! - Self-describing records, legacy `salt:digest` records still verify
//! - Constant-time digest comparison
//!
//! ## Login Throttling (`rate_limiter`)
//! - Fixed window per key (source address, optionally plus identity)
//! - Sharded window table, no global lock
//!
//! ## Session Tokens (`token_issuer`)
//! - HS256 only; other algorithms are rejected before verification
//! - Near-expiry refresh against the identity store, bounded by a timeout
//!
//! ## Audit Recording (`audit`)
//! - Bounded queue with a single consumer, configurable overflow policy
//! - File sink with SHA-256 hash chain, memory and tracing sinks
//!
//! # Usage Examples
//!
//! ## Login
//!
//! ```rust,no_run
//! use security_core::{
//!     CredentialHasher, RateLimiter, RateLimiterConfig, Role, TokenConfig, TokenIssuer,
//! };
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hasher = CredentialHasher::default();
//! let limiter = RateLimiter::new(RateLimiterConfig::default());
//! let issuer = TokenIssuer::new(&TokenConfig::default(), b"0123456789abcdef0123456789abcdef")?;
//!
//! let record = hasher.hash("correct horse battery staple")?;
//!
//! limiter.check("203.0.113.7").into_result()?;
//! if hasher.verify("correct horse battery staple", &record) {
//!     let signed = issuer.issue(42, 7, Role::Admin)?;
//!     println!("expires at {}", signed.claims.expires_at());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Audit Recording
//!
//! ```rust,no_run
//! use security_core::{AuditConfig, AuditEvent, AuditRecorder, TracingSink};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let recorder = AuditRecorder::spawn(Arc::new(TracingSink), &AuditConfig::default())?;
//!
//! recorder.record(
//!     AuditEvent::from_outcome("POST /api/auth/login", 401)
//!         .with_source("203.0.113.7")
//!         .with_user_agent("curl/8.0"),
//! )?;
//!
//! recorder.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod audit;
pub mod config;
pub mod credential_hasher;
pub mod crypto_vault;
pub mod error;
pub mod metrics;
pub mod rate_limiter;
pub mod token_issuer;

// Re-exports for convenience
pub use audit::{
    classify_risk, AuditConfig, AuditEvent, AuditQuery, AuditRecorder, AuditSink, FileSink,
    MemorySink, OverflowPolicy, RiskLevel, SinkConfig, TracingSink,
};
pub use config::{ResolvedKeys, SecurityConfig};
pub use credential_hasher::{CredentialHasher, HasherConfig, PasswordRecord};
pub use crypto_vault::{CryptoVault, EncryptedBlob, VaultConfig};
pub use error::{Result, SecurityError};
pub use metrics::METRICS;
pub use rate_limiter::{KeyPolicy, RateLimitKey, RateLimitResult, RateLimiter, RateLimiterConfig};
pub use token_issuer::{
    IdentityLookup, IdentitySnapshot, Role, SessionClaims, SignedToken, SubjectId, TenantId,
    TokenConfig, TokenIssuer, TokenProfile, TokenState,
};
