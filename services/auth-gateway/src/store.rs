// Persistence collaborator for the security core
// Credentials, accounts and billing; the in-memory store backs tests and local runs

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use security_core::{
    EncryptedBlob, IdentityLookup, IdentitySnapshot, Role, SecurityError, SubjectId, TenantId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::errors::StoreError;
use crate::models::{BillingStatus, NewAccount, RegisteredAccount, StoredCredential};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up a user by normalised email
    async fn find_credential_by_identity(&self, email: &str)
        -> StoreResult<Option<StoredCredential>>;

    /// Create company, admin user and initial billing record, all or nothing
    async fn register_account(&self, account: NewAccount) -> StoreResult<RegisteredAccount>;

    async fn billing_status(&self, tenant_id: TenantId) -> StoreResult<Option<BillingStatus>>;

    /// Replace a password record wholesale
    async fn update_password_hash(&self, subject_id: SubjectId, password_hash: String)
        -> StoreResult<()>;

    /// Current role, tenant and status of a user
    async fn identity(&self, subject_id: SubjectId) -> StoreResult<Option<IdentitySnapshot>>;
}

/// Exposes a [`CredentialStore`] to the token issuer's refresh path
pub struct StoreIdentityLookup(pub Arc<dyn CredentialStore>);

#[async_trait]
impl IdentityLookup for StoreIdentityLookup {
    async fn current_identity(
        &self,
        subject_id: SubjectId,
    ) -> security_core::Result<Option<IdentitySnapshot>> {
        self.0
            .identity(subject_id)
            .await
            .map_err(|e| SecurityError::RefreshLookupFailed(e.to_string()))
    }
}

/// Company row as held by the in-memory store
#[derive(Debug, Clone)]
pub struct CompanyRecord {
    pub name: String,
    pub email: String,
    pub protected_tax_id: Option<EncryptedBlob>,
    pub business_size: String,
    pub sector: String,
    pub storage_type: String,
    pub plan: String,
}

#[derive(Debug, Clone)]
struct UserRow {
    email: String,
    password_hash: String,
    role: Role,
    tenant_id: TenantId,
    active: bool,
}

#[derive(Debug, Default)]
struct Tables {
    next_tenant_id: TenantId,
    next_subject_id: SubjectId,
    companies: HashMap<TenantId, CompanyRecord>,
    users: HashMap<SubjectId, UserRow>,
    users_by_email: HashMap<String, SubjectId>,
    billing: HashMap<TenantId, BillingStatus>,
}

/// All tables behind one lock, so a registration is never half-visible
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored password record for an email
    pub fn password_hash(&self, email: &str) -> Option<String> {
        let tables = self.tables.lock();
        let id = tables.users_by_email.get(email)?;
        tables.users.get(id).map(|u| u.password_hash.clone())
    }

    /// Stored tax id ciphertext for a tenant
    pub fn protected_tax_id(&self, tenant_id: TenantId) -> Option<EncryptedBlob> {
        self.tables
            .lock()
            .companies
            .get(&tenant_id)
            .and_then(|c| c.protected_tax_id.clone())
    }

    pub fn company(&self, tenant_id: TenantId) -> Option<CompanyRecord> {
        self.tables.lock().companies.get(&tenant_id).cloned()
    }

    pub fn set_role(&self, subject_id: SubjectId, role: Role) {
        if let Some(user) = self.tables.lock().users.get_mut(&subject_id) {
            user.role = role;
        }
    }

    pub fn set_active(&self, subject_id: SubjectId, active: bool) {
        if let Some(user) = self.tables.lock().users.get_mut(&subject_id) {
            user.active = active;
        }
    }

    pub fn user_count(&self) -> usize {
        self.tables.lock().users.len()
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn find_credential_by_identity(
        &self,
        email: &str,
    ) -> StoreResult<Option<StoredCredential>> {
        let tables = self.tables.lock();
        Ok(tables.users_by_email.get(email).and_then(|id| {
            tables.users.get(id).map(|u| StoredCredential {
                subject_id: *id,
                tenant_id: u.tenant_id,
                email: u.email.clone(),
                password_hash: u.password_hash.clone(),
                role: u.role,
                active: u.active,
            })
        }))
    }

    async fn register_account(&self, account: NewAccount) -> StoreResult<RegisteredAccount> {
        let mut tables = self.tables.lock();

        if tables.users_by_email.contains_key(&account.email) {
            return Err(StoreError::DuplicateIdentity);
        }

        tables.next_tenant_id += 1;
        tables.next_subject_id += 1;
        let tenant_id = tables.next_tenant_id;
        let subject_id = tables.next_subject_id;

        tables.companies.insert(
            tenant_id,
            CompanyRecord {
                name: account.company_name,
                email: account.email.clone(),
                protected_tax_id: account.protected_tax_id,
                business_size: account.business_size,
                sector: account.sector,
                storage_type: account.storage_type,
                plan: account.plan.clone(),
            },
        );
        tables.users.insert(
            subject_id,
            UserRow {
                email: account.email.clone(),
                password_hash: account.password_hash,
                role: Role::Admin,
                tenant_id,
                active: true,
            },
        );
        tables.users_by_email.insert(account.email, subject_id);
        tables
            .billing
            .insert(tenant_id, BillingStatus::initial(&account.plan, Utc::now()));

        info!("Registered tenant {} with admin {}", tenant_id, subject_id);
        Ok(RegisteredAccount {
            subject_id,
            tenant_id,
        })
    }

    async fn billing_status(&self, tenant_id: TenantId) -> StoreResult<Option<BillingStatus>> {
        Ok(self.tables.lock().billing.get(&tenant_id).cloned())
    }

    async fn update_password_hash(
        &self,
        subject_id: SubjectId,
        password_hash: String,
    ) -> StoreResult<()> {
        if let Some(user) = self.tables.lock().users.get_mut(&subject_id) {
            user.password_hash = password_hash;
        }
        Ok(())
    }

    async fn identity(&self, subject_id: SubjectId) -> StoreResult<Option<IdentitySnapshot>> {
        Ok(self
            .tables
            .lock()
            .users
            .get(&subject_id)
            .map(|u| IdentitySnapshot {
                subject_id,
                tenant_id: u.tenant_id,
                role: u.role,
                active: u.active,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(email: &str) -> NewAccount {
        NewAccount {
            company_name: "Acme".to_string(),
            email: email.to_string(),
            password_hash: "$argon2id$stub".to_string(),
            protected_tax_id: None,
            business_size: "small".to_string(),
            sector: "retail".to_string(),
            storage_type: "cloud".to_string(),
            plan: "pro".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_creates_all_rows() {
        let store = InMemoryStore::new();
        let registered = store.register_account(account("a@acme.io")).await.unwrap();

        let credential = store
            .find_credential_by_identity("a@acme.io")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credential.role, Role::Admin);
        assert_eq!(credential.tenant_id, registered.tenant_id);

        let billing = store
            .billing_status(registered.tenant_id)
            .await
            .unwrap()
            .unwrap();
        assert!(billing.active);
        assert_eq!(billing.amount_cents, 9_900);
    }

    #[tokio::test]
    async fn test_duplicate_email_leaves_no_trace() {
        let store = InMemoryStore::new();
        store.register_account(account("a@acme.io")).await.unwrap();

        let err = store.register_account(account("a@acme.io")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity));
        assert_eq!(store.user_count(), 1);
        assert!(store.billing_status(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_identity_lookup_reflects_changes() {
        let store = Arc::new(InMemoryStore::new());
        let registered = store.register_account(account("a@acme.io")).await.unwrap();
        store.set_role(registered.subject_id, Role::Staff);

        let lookup = StoreIdentityLookup(store.clone());
        let snapshot = lookup
            .current_identity(registered.subject_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.role, Role::Staff);
        assert!(lookup.current_identity(999).await.unwrap().is_none());
    }
}
