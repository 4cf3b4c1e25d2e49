//! Session Tokens
//!
//! HS256-signed JWTs carrying subject, tenant and role. A token is
//! Issued → Valid → NearExpiry → Expired/Invalid:
//!
//! - validation accepts only HS256, a verifying signature, a well-typed
//!   payload and `now < exp`
//! - once the remaining lifetime drops below the refresh threshold a new
//!   token is minted with a fresh expiry; the presented token stays valid
//!   until its own expiry
//! - refresh re-reads role and tenant from the identity store, so a demoted
//!   or removed account is never silently extended

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SecurityError};
use crate::metrics::METRICS;

/// The only accepted signing algorithm
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

/// Minimum signing secret length in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Longest accepted token lifetime (one year)
pub const MAX_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Subject (user) identifier
pub type SubjectId = u64;

/// Tenant (company) identifier
pub type TenantId = u64;

/// Account role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Tenant administrator
    Admin,
    /// Manages day-to-day records
    Manager,
    /// Regular member
    Staff,
}

impl Role {
    /// Stored/wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "staff" => Ok(Role::Staff),
            other => Err(SecurityError::TokenMalformed(format!("Unknown role: {}", other))),
        }
    }
}

/// Authenticated identity carried in a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject id
    pub sub: SubjectId,

    /// Tenant id
    pub tid: TenantId,

    /// Role
    pub role: Role,

    /// Issued at (unix seconds)
    pub iat: i64,

    /// Expires at (unix seconds)
    pub exp: i64,

    /// Issuer
    pub iss: String,

    /// Token id
    pub jti: Uuid,
}

impl SessionClaims {
    /// Seconds left before expiry at `now` (negative once expired)
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        self.exp - now.timestamp()
    }

    /// Expiry as a timestamp
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A signed token together with the claims it carries
#[derive(Clone)]
pub struct SignedToken {
    /// Compact JWT
    pub token: String,

    /// Claims inside the token
    pub claims: SessionClaims,
}

impl fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignedToken")
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

/// Where a valid token sits in its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// More than the refresh threshold left
    Valid,
    /// Valid, but due for refresh
    NearExpiry,
    /// Past expiry
    Expired,
}

/// Current account state as known to the identity store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySnapshot {
    /// Subject id
    pub subject_id: SubjectId,
    /// Current tenant
    pub tenant_id: TenantId,
    /// Current role
    pub role: Role,
    /// Whether the account may still sign in
    pub active: bool,
}

/// Read access to the identity store for refresh
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Current state of an account, `None` if it no longer exists
    async fn current_identity(&self, subject_id: SubjectId) -> Result<Option<IdentitySnapshot>>;
}

/// Token lifetime profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenProfile {
    /// 15 minutes
    ShortLived,
    /// 24 hours
    Extended,
}

impl TokenProfile {
    /// Lifetime in seconds
    pub fn ttl_secs(&self) -> u64 {
        match self {
            TokenProfile::ShortLived => 15 * 60,
            TokenProfile::Extended => 24 * 60 * 60,
        }
    }
}

/// Token configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC secret, at least 32 bytes
    pub secret: Option<String>,

    /// Lifetime profile
    pub profile: TokenProfile,

    /// Explicit lifetime overriding the profile
    pub ttl_secs: Option<u64>,

    /// Refresh once fewer than this many seconds remain
    pub refresh_threshold_secs: u64,

    /// Upper bound on the identity lookup during refresh
    pub refresh_lookup_timeout_ms: u64,

    /// Re-read role/tenant from the identity store before refreshing.
    /// When false the presented claims are copied forward.
    pub refresh_requires_lookup: bool,

    /// `iss` claim
    pub issuer: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            profile: TokenProfile::ShortLived,
            ttl_secs: None,
            refresh_threshold_secs: 5 * 60,
            refresh_lookup_timeout_ms: 250,
            refresh_requires_lookup: true,
            issuer: "titan-auth".to_string(),
        }
    }
}

impl fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("profile", &self.profile)
            .field("ttl_secs", &self.ttl_secs)
            .field("refresh_threshold_secs", &self.refresh_threshold_secs)
            .field("refresh_lookup_timeout_ms", &self.refresh_lookup_timeout_ms)
            .field("refresh_requires_lookup", &self.refresh_requires_lookup)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl TokenConfig {
    /// Effective lifetime in seconds
    pub fn effective_ttl_secs(&self) -> u64 {
        self.ttl_secs.unwrap_or_else(|| self.profile.ttl_secs())
    }

    /// Reject a zero lifetime or a threshold that would refresh every token
    pub fn validate(&self) -> Result<()> {
        let ttl = self.effective_ttl_secs();
        if ttl == 0 {
            return Err(SecurityError::Config("Token lifetime cannot be zero".to_string()));
        }
        if ttl > MAX_TTL_SECS {
            return Err(SecurityError::Config(format!(
                "Token lifetime ({}s) exceeds {}s",
                ttl, MAX_TTL_SECS
            )));
        }
        if self.refresh_threshold_secs >= ttl {
            return Err(SecurityError::Config(format!(
                "Refresh threshold ({}s) must be shorter than token lifetime ({}s)",
                self.refresh_threshold_secs, ttl
            )));
        }
        if self.issuer.is_empty() {
            return Err(SecurityError::Config("Token issuer cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Builds, signs, verifies and refreshes session tokens
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
    refresh_threshold: Duration,
    lookup_timeout: std::time::Duration,
    requires_lookup: bool,
    issuer: String,
    identity: Option<Arc<dyn IdentityLookup>>,
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("ttl", &self.ttl)
            .field("refresh_threshold", &self.refresh_threshold)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Create an issuer over an already-resolved secret
    pub fn new(config: &TokenConfig, secret: &[u8]) -> Result<Self> {
        config.validate()?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(SecurityError::Config(format!(
                "Token secret must be at least {} bytes",
                MIN_SECRET_LEN
            )));
        }

        let mut validation = Validation::new(SIGNING_ALGORITHM);
        // Expiry is checked against an explicit clock in `validate_at`
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "iss"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl: Duration::seconds(config.effective_ttl_secs() as i64),
            refresh_threshold: Duration::seconds(config.refresh_threshold_secs as i64),
            lookup_timeout: std::time::Duration::from_millis(config.refresh_lookup_timeout_ms),
            requires_lookup: config.refresh_requires_lookup,
            issuer: config.issuer.clone(),
            identity: None,
        })
    }

    /// Attach the identity store consulted on refresh
    pub fn with_identity_lookup(mut self, identity: Arc<dyn IdentityLookup>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Token lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Refresh threshold
    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    /// Mint a token for an identity
    pub fn issue(&self, subject: SubjectId, tenant: TenantId, role: Role) -> Result<SignedToken> {
        self.issue_at(subject, tenant, role, Utc::now())
    }

    /// Mint a token as of `now`
    pub fn issue_at(
        &self,
        subject: SubjectId,
        tenant: TenantId,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<SignedToken> {
        let iat = now.timestamp();
        let claims = SessionClaims {
            sub: subject,
            tid: tenant,
            role,
            iat,
            exp: iat + self.ttl.num_seconds(),
            iss: self.issuer.clone(),
            jti: Uuid::new_v4(),
        };

        let token = encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| SecurityError::TokenSigning(e.to_string()))?;

        METRICS.tokens_issued_total.inc();
        debug!("Issued token for subject {} (tenant {})", subject, tenant);

        Ok(SignedToken { token, claims })
    }

    /// Verify a token and reconstruct its claims
    pub fn validate(&self, token: &str) -> Result<SessionClaims> {
        self.validate_at(token, Utc::now())
    }

    /// Verify a token as of `now`
    pub fn validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims> {
        self.check(token, now).map_err(|e| {
            METRICS
                .token_validation_failures_total
                .with_label_values(&[e.kind()])
                .inc();
            debug!("Token rejected: {}", e.kind());
            e
        })
    }

    fn check(&self, token: &str, now: DateTime<Utc>) -> Result<SessionClaims> {
        // Read `alg` before handing the token to the verifier so that unknown
        // algorithms (including "none") are reported as a mismatch.
        match header_algorithm(token)?.parse::<Algorithm>() {
            Ok(alg) if alg == SIGNING_ALGORITHM => {}
            _ => return Err(SecurityError::TokenAlgorithmMismatch),
        }

        let claims = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => SecurityError::TokenSignatureInvalid,
                ErrorKind::InvalidAlgorithm => SecurityError::TokenAlgorithmMismatch,
                ErrorKind::ExpiredSignature => SecurityError::TokenExpired,
                _ => SecurityError::TokenMalformed(e.to_string()),
            })?
            .claims;

        if claims.exp <= claims.iat {
            return Err(SecurityError::TokenMalformed(
                "Expiry not after issue time".to_string(),
            ));
        }
        if claims.iss != self.issuer {
            return Err(SecurityError::TokenMalformed("Unexpected issuer".to_string()));
        }
        if now.timestamp() >= claims.exp {
            return Err(SecurityError::TokenExpired);
        }

        Ok(claims)
    }

    /// Lifetime state of validated claims at `now`
    pub fn state_at(&self, claims: &SessionClaims, now: DateTime<Utc>) -> TokenState {
        let remaining = claims.remaining_secs(now);
        if remaining <= 0 {
            TokenState::Expired
        } else if remaining < self.refresh_threshold.num_seconds() {
            TokenState::NearExpiry
        } else {
            TokenState::Valid
        }
    }

    /// Re-issue if the token is near expiry
    pub async fn maybe_refresh(&self, claims: &SessionClaims) -> Option<SignedToken> {
        self.maybe_refresh_at(claims, Utc::now()).await
    }

    /// Re-issue as of `now` if fewer than the threshold seconds remain.
    /// Any lookup failure means no refresh; the caller keeps its token.
    pub async fn maybe_refresh_at(
        &self,
        claims: &SessionClaims,
        now: DateTime<Utc>,
    ) -> Option<SignedToken> {
        if self.state_at(claims, now) != TokenState::NearExpiry {
            return None;
        }

        let (tenant, role) = if self.requires_lookup {
            match self.current_identity(claims.sub).await {
                Ok(snapshot) => (snapshot.tenant_id, snapshot.role),
                Err(e) => {
                    METRICS.token_refresh_skipped_total.inc();
                    warn!("Token refresh skipped for subject {}: {}", claims.sub, e);
                    return None;
                }
            }
        } else {
            (claims.tid, claims.role)
        };

        match self.issue_at(claims.sub, tenant, role, now) {
            Ok(token) => {
                METRICS.tokens_refreshed_total.inc();
                info!(
                    "Refreshed token for subject {} ({}s remained)",
                    claims.sub,
                    claims.remaining_secs(now)
                );
                Some(token)
            }
            Err(e) => {
                warn!("Token refresh failed for subject {}: {}", claims.sub, e);
                None
            }
        }
    }

    async fn current_identity(&self, subject: SubjectId) -> Result<IdentitySnapshot> {
        let identity = self.identity.as_ref().ok_or_else(|| {
            SecurityError::RefreshLookupFailed("No identity store configured".to_string())
        })?;

        let snapshot = tokio::time::timeout(self.lookup_timeout, identity.current_identity(subject))
            .await
            .map_err(|_| SecurityError::RefreshLookupFailed("Lookup timed out".to_string()))?
            .map_err(|e| SecurityError::RefreshLookupFailed(e.to_string()))?
            .ok_or_else(|| SecurityError::RefreshLookupFailed("Account not found".to_string()))?;

        if !snapshot.active {
            return Err(SecurityError::RefreshLookupFailed(
                "Account disabled".to_string(),
            ));
        }
        Ok(snapshot)
    }
}

fn header_algorithm(token: &str) -> Result<String> {
    let malformed = |what: &str| SecurityError::TokenMalformed(what.to_string());

    let header = token.split('.').next().ok_or_else(|| malformed("Empty token"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|_| malformed("Header is not base64url"))?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| malformed("Header is not JSON"))?;

    value
        .get("alg")
        .and_then(|alg| alg.as_str())
        .map(str::to_string)
        .ok_or_else(|| malformed("Header has no algorithm"))
}
