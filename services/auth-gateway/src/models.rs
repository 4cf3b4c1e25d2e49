use chrono::{DateTime, Utc};
use security_core::{EncryptedBlob, Role, SessionClaims, SubjectId, TenantId};
use serde::{Deserialize, Serialize};

/// Registration body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegisterRequest {
    pub company_name: String,
    pub email: String,
    pub password: String,
    pub plan: String,
    #[serde(alias = "cnpj")]
    pub tax_id: String,
    pub business_size: String,
    pub sector: String,
    pub storage_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub message: String,
    pub tenant_id: TenantId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub subject_id: SubjectId,
    pub tenant_id: TenantId,
    pub role: Role,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&SessionClaims> for SessionResponse {
    fn from(claims: &SessionClaims) -> Self {
        Self {
            subject_id: claims.sub,
            tenant_id: claims.tid,
            role: claims.role,
            issued_at: DateTime::from_timestamp(claims.iat, 0).unwrap_or(DateTime::<Utc>::MIN_UTC),
            expires_at: claims.expires_at(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub audit_pending: usize,
    pub audit_dropped: u64,
}

/// Everything one registration writes
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub company_name: String,
    /// Normalised (trimmed, lowercased)
    pub email: String,
    /// Encoded password record
    pub password_hash: String,
    /// Absent when PII encryption is disabled
    pub protected_tax_id: Option<EncryptedBlob>,
    pub business_size: String,
    pub sector: String,
    pub storage_type: String,
    pub plan: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredAccount {
    pub subject_id: SubjectId,
    pub tenant_id: TenantId,
}

/// Login-time view of a user row
#[derive(Clone)]
pub struct StoredCredential {
    pub subject_id: SubjectId,
    pub tenant_id: TenantId,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub active: bool,
}

impl std::fmt::Debug for StoredCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredCredential")
            .field("subject_id", &self.subject_id)
            .field("tenant_id", &self.tenant_id)
            .field("role", &self.role)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Billing state of a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingStatus {
    pub status: String,
    pub active: bool,
    pub plan: String,
    pub payment_method: String,
    pub amount_cents: i64,
    pub next_due_date: DateTime<Utc>,
}

impl BillingStatus {
    pub const ACTIVE: &'static str = "Active";
    pub const DEFAULT_PAYMENT_METHOD: &'static str = "Credit Card";
    pub const DEFAULT_AMOUNT_CENTS: i64 = 9_900;

    /// Billing record created alongside a new account
    pub fn initial(plan: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: Self::ACTIVE.to_string(),
            active: true,
            plan: plan.to_string(),
            payment_method: Self::DEFAULT_PAYMENT_METHOD.to_string(),
            amount_cents: Self::DEFAULT_AMOUNT_CENTS,
            next_due_date: now
                .checked_add_months(chrono::Months::new(1))
                .unwrap_or(now),
        }
    }
}

/// Actor attached to a response so the audit layer can attribute it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditActor {
    pub subject_id: SubjectId,
    pub tenant_id: TenantId,
}

/// Why a request was rejected, for the audit layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditReason(pub &'static str);

impl From<&SessionClaims> for AuditActor {
    fn from(claims: &SessionClaims) -> Self {
        Self {
            subject_id: claims.sub,
            tenant_id: claims.tid,
        }
    }
}
