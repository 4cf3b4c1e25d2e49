// Postgres credential store and audit sink
// Registration runs in one transaction; any failed insert rolls the whole account back

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use security_core::{
    AuditEvent, AuditSink, EncryptedBlob, IdentitySnapshot, Role, SecurityError, SubjectId,
    TenantId,
};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{DatabaseConfig, GatewayConfig};
use crate::errors::StoreError;
use crate::models::{BillingStatus, NewAccount, RegisteredAccount, StoredCredential};
use crate::store::{CredentialStore, StoreResult};

const UNIQUE_VIOLATION: &str = "23505";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and apply pending migrations
    pub async fn connect(config: &DatabaseConfig, url: &str) -> StoreResult<Self> {
        info!("Connecting to database");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url)
            .await?;

        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_role(value: &str) -> StoreResult<Role> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("Unknown role: {}", value)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_credential_by_identity(
        &self,
        email: &str,
    ) -> StoreResult<Option<StoredCredential>> {
        let row = sqlx::query(
            r#"
            SELECT id, company_id, email, password_hash, role, active
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> StoreResult<StoredCredential> {
            let role: String = row.try_get("role")?;
            Ok(StoredCredential {
                subject_id: row.try_get::<i64, _>("id")? as SubjectId,
                tenant_id: row.try_get::<i64, _>("company_id")? as TenantId,
                email: row.try_get("email")?,
                password_hash: row.try_get("password_hash")?,
                role: parse_role(&role)?,
                active: row.try_get("active")?,
            })
        })
        .transpose()
    }

    async fn register_account(&self, account: NewAccount) -> StoreResult<RegisteredAccount> {
        let mut tx = self.pool.begin().await?;

        let tenant_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO companies (
                name, email, encrypted_tax_id, business_size, sector, storage_type, plan_type
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(&account.company_name)
        .bind(&account.email)
        .bind(account.protected_tax_id.as_ref().map(EncryptedBlob::as_str))
        .bind(&account.business_size)
        .bind(&account.sector)
        .bind(&account.storage_type)
        .bind(&account.plan)
        .fetch_one(&mut *tx)
        .await?;

        let subject_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (email, password_hash, role, company_id)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&account.email)
        .bind(&account.password_hash)
        .bind(Role::Admin.as_str())
        .bind(tenant_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::DuplicateIdentity
            } else {
                StoreError::Database(e)
            }
        })?;

        let billing = BillingStatus::initial(&account.plan, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO billings (
                company_id, status, active, plan, payment_method, amount_cents, next_due_date
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(tenant_id)
        .bind(&billing.status)
        .bind(billing.active)
        .bind(&billing.plan)
        .bind(&billing.payment_method)
        .bind(billing.amount_cents)
        .bind(billing.next_due_date)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!("Registered tenant {} with admin {}", tenant_id, subject_id);
        Ok(RegisteredAccount {
            subject_id: subject_id as SubjectId,
            tenant_id: tenant_id as TenantId,
        })
    }

    async fn billing_status(&self, tenant_id: TenantId) -> StoreResult<Option<BillingStatus>> {
        let row = sqlx::query(
            r#"
            SELECT status, active, plan, payment_method, amount_cents, next_due_date
            FROM billings
            WHERE company_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> StoreResult<BillingStatus> {
            Ok(BillingStatus {
                status: row.try_get("status")?,
                active: row.try_get("active")?,
                plan: row.try_get("plan")?,
                payment_method: row.try_get("payment_method")?,
                amount_cents: row.try_get("amount_cents")?,
                next_due_date: row.try_get::<DateTime<Utc>, _>("next_due_date")?,
            })
        })
        .transpose()
    }

    async fn update_password_hash(
        &self,
        subject_id: SubjectId,
        password_hash: String,
    ) -> StoreResult<()> {
        let result = sqlx::query("UPDATE users SET password_hash = $1 WHERE id = $2")
            .bind(password_hash)
            .bind(subject_id as i64)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!("Password update for unknown subject {}", subject_id);
        }
        Ok(())
    }

    async fn identity(&self, subject_id: SubjectId) -> StoreResult<Option<IdentitySnapshot>> {
        let row = sqlx::query("SELECT company_id, role, active FROM users WHERE id = $1")
            .bind(subject_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> StoreResult<IdentitySnapshot> {
            let role: String = row.try_get("role")?;
            Ok(IdentitySnapshot {
                subject_id,
                tenant_id: row.try_get::<i64, _>("company_id")? as TenantId,
                role: parse_role(&role)?,
                active: row.try_get("active")?,
            })
        })
        .transpose()
    }
}

/// Writes each audit event as one row of `audit_logs`
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn write(&self, event: AuditEvent) -> security_core::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                event_id, occurred_at, actor_id, tenant_id, action, source_addr,
                user_agent, status, risk_level, reason, event_hash
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(event.event_id)
        .bind(event.timestamp)
        .bind(event.actor_id.map(|id| id as i64))
        .bind(event.tenant_id.map(|id| id as i64))
        .bind(&event.action)
        .bind(&event.source_addr)
        .bind(&event.user_agent)
        .bind(i32::from(event.status))
        .bind(event.risk_level().as_str())
        .bind(&event.reason)
        .bind(&event.hash)
        .execute(&self.pool)
        .await
        .map_err(|e| SecurityError::AuditSink(e.to_string()))?;

        Ok(())
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}

/// Audit destination: `audit_logs` when a database is connected and
/// `database.audit_log` is on, the configured sink otherwise
pub fn audit_sink(
    config: &GatewayConfig,
    pool: Option<&PgPool>,
) -> security_core::Result<Arc<dyn AuditSink>> {
    match pool {
        Some(pool) if config.database.audit_log => Ok(Arc::new(PgAuditSink::new(pool.clone()))),
        _ => config.security.audit.sink.build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CorsConfig, ServerConfig};
    use security_core::{SecurityConfig, SinkConfig};

    fn config(audit_log: bool) -> GatewayConfig {
        let mut security = SecurityConfig::default();
        security.audit.sink = SinkConfig::Memory;
        GatewayConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
                limiter_cleanup_secs: 60,
            },
            cors: CorsConfig {
                allowed_origins: vec!["http://localhost:5173".to_string()],
            },
            database: DatabaseConfig {
                url: Some("postgres://titan@localhost/titan".to_string()),
                max_connections: 1,
                audit_log,
            },
            security,
        }
    }

    fn lazy_pool() -> PgPool {
        // Never connects unless a query runs
        PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://titan@localhost/titan")
            .unwrap()
    }

    #[tokio::test]
    async fn test_audit_goes_to_database_when_connected() {
        let pool = lazy_pool();
        assert_eq!(audit_sink(&config(true), Some(&pool)).unwrap().kind(), "postgres");
    }

    #[tokio::test]
    async fn test_audit_falls_back_to_configured_sink() {
        let pool = lazy_pool();
        assert_eq!(audit_sink(&config(false), Some(&pool)).unwrap().kind(), "memory");
        assert_eq!(audit_sink(&config(true), None).unwrap().kind(), "memory");
    }
}
