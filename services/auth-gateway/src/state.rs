use security_core::{
    AuditRecorder, AuditSink, CredentialHasher, CryptoVault, KeyPolicy, PasswordRecord,
    RateLimiter, ResolvedKeys, SecurityConfig, TokenIssuer,
};
use std::sync::Arc;
use tracing::info;

use crate::store::{CredentialStore, StoreIdentityLookup};

/// Shared handles for every request
#[derive(Clone)]
pub struct AppState {
    pub vault: Arc<CryptoVault>,
    pub hasher: Arc<CredentialHasher>,
    pub limiter: Arc<RateLimiter>,
    pub issuer: Arc<TokenIssuer>,
    pub audit: Arc<AuditRecorder>,
    pub store: Arc<dyn CredentialStore>,
    pub key_policy: KeyPolicy,
    /// Verified against when the submitted identity is unknown, so both
    /// failure paths cost one hash
    pub dummy_record: Arc<PasswordRecord>,
}

impl AppState {
    /// Wire the security core to a store and an audit sink.
    /// Spawns the audit consumer, so it must run inside a tokio runtime.
    pub fn new(
        config: &SecurityConfig,
        keys: &ResolvedKeys,
        store: Arc<dyn CredentialStore>,
        audit_sink: Arc<dyn AuditSink>,
    ) -> security_core::Result<Self> {
        config.validate()?;

        let vault = CryptoVault::from_config(&config.vault, &keys.vault_key);
        let hasher = CredentialHasher::new(config.hasher.clone())?;
        let limiter = RateLimiter::new(config.rate_limiter.clone());
        let issuer = TokenIssuer::new(&config.token, &keys.token_secret)?
            .with_identity_lookup(Arc::new(StoreIdentityLookup(store.clone())));
        let audit = AuditRecorder::spawn(audit_sink, &config.audit)?;
        let dummy_record = hasher.hash("dummy-password-for-unknown-identities")?;

        info!(
            "Security core ready (token ttl {}s, {} attempts per {}s)",
            issuer.ttl().num_seconds(),
            config.rate_limiter.max_attempts,
            config.rate_limiter.window_secs
        );

        Ok(Self {
            vault: Arc::new(vault),
            hasher: Arc::new(hasher),
            limiter: Arc::new(limiter),
            issuer: Arc::new(issuer),
            audit: Arc::new(audit),
            store,
            key_policy: config.rate_limiter.key_policy,
            dummy_record: Arc::new(dummy_record),
        })
    }
}
