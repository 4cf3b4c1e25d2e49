// HTTP handlers for registration, login and session routes

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use security_core::{PasswordRecord, RateLimitKey, SecurityError, SessionClaims, METRICS};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{ApiError, Result};
use crate::models::{
    AuditActor, BillingStatus, HealthResponse, LoginRequest, LoginResponse, NewAccount,
    RegisterRequest, RegisterResponse, SessionResponse, UserSummary,
};
use crate::state::AppState;

pub const SESSION_COOKIE: &str = "jwt";
pub const MIN_PASSWORD_LEN: usize = 8;

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn session_cookie(token: &str, max_age_secs: i64) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; Secure; SameSite=Strict",
        SESSION_COOKIE, token, max_age_secs
    ))
    .map_err(|e| ApiError::Internal(format!("Invalid cookie value: {}", e)))
}

/// Run Argon2 off the async workers
async fn hash_password(state: &AppState, password: String) -> Result<PasswordRecord> {
    let hasher = state.hasher.clone();
    tokio::task::spawn_blocking(move || hasher.hash(&password))
        .await
        .map_err(|e| ApiError::Internal(format!("Hashing task failed: {}", e)))?
        .map_err(ApiError::from)
}

async fn verify_password(state: &AppState, password: String, record: Arc<PasswordRecord>) -> bool {
    let hasher = state.hasher.clone();
    tokio::task::spawn_blocking(move || hasher.verify(&password, &record))
        .await
        .unwrap_or(false)
}

// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "auth-gateway",
        version: env!("CARGO_PKG_VERSION"),
        audit_pending: state.audit.pending(),
        audit_dropped: state.audit.dropped_count(),
    })
}

// Prometheus metrics endpoint
pub async fn metrics_handler() -> Result<String> {
    METRICS
        .export()
        .map_err(|e| ApiError::Internal(format!("Failed to export metrics: {}", e)))
}

pub async fn register(
    State(state): State<AppState>,
    payload: std::result::Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>)> {
    let Json(req) = payload.map_err(|_| ApiError::Validation("Invalid request".to_string()))?;

    let email = normalize_email(&req.email);
    if email.is_empty() || req.password.is_empty() {
        return Err(ApiError::Validation(
            "Email and password are required".to_string(),
        ));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    let protected_tax_id = if state.vault.is_enabled() && !req.tax_id.trim().is_empty() {
        Some(state.vault.encrypt_str(req.tax_id.trim())?)
    } else {
        None
    };

    let record = hash_password(&state, req.password).await?;

    let registered = state
        .store
        .register_account(NewAccount {
            company_name: req.company_name,
            email,
            password_hash: record.encode(),
            protected_tax_id,
            business_size: req.business_size,
            sector: req.sector,
            storage_type: req.storage_type,
            plan: req.plan,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "Registration successful".to_string(),
            tenant_id: registered.tenant_id,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    payload: std::result::Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response> {
    let Json(req) = payload.map_err(|_| ApiError::Validation("Invalid request".to_string()))?;
    let email = normalize_email(&req.email);

    // Throttle before any credential lookup
    let key = state.key_policy.key(peer.ip(), Some(&email));
    state.limiter.check(&key).into_result()?;

    let credential = state.store.find_credential_by_identity(&email).await?;

    let Some(credential) = credential else {
        // Same cost as a real verification
        verify_password(&state, req.password, state.dummy_record.clone()).await;
        METRICS.login_failures_total.inc();
        return Err(SecurityError::InvalidCredentials.into());
    };

    let record = match PasswordRecord::parse(&credential.password_hash) {
        Ok(record) => Arc::new(record),
        Err(e) => {
            warn!("Unreadable password record for subject {}: {}", credential.subject_id, e);
            verify_password(&state, req.password, state.dummy_record.clone()).await;
            METRICS.login_failures_total.inc();
            return Err(SecurityError::InvalidCredentials.into());
        }
    };

    if !verify_password(&state, req.password.clone(), record.clone()).await || !credential.active {
        METRICS.login_failures_total.inc();
        return Err(SecurityError::InvalidCredentials.into());
    }

    if state.hasher.needs_rehash(&record) {
        match hash_password(&state, req.password).await {
            Ok(upgraded) => {
                if let Err(e) = state
                    .store
                    .update_password_hash(credential.subject_id, upgraded.encode())
                    .await
                {
                    warn!("Password rehash not stored for subject {}: {}", credential.subject_id, e);
                }
            }
            Err(e) => warn!("Password rehash failed for subject {}: {}", credential.subject_id, e),
        }
    }

    let signed = state
        .issuer
        .issue(credential.subject_id, credential.tenant_id, credential.role)?;
    info!("Login succeeded for subject {}", credential.subject_id);

    let cookie = session_cookie(&signed.token, state.issuer.ttl().num_seconds())?;
    let body = LoginResponse {
        token: signed.token,
        expires_at: signed.claims.expires_at(),
        user: UserSummary {
            email: credential.email,
            role: credential.role,
        },
    };

    let mut response = Json(body).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    response.extensions_mut().insert(AuditActor::from(&signed.claims));
    Ok(response)
}

pub async fn session(Extension(claims): Extension<SessionClaims>) -> Json<SessionResponse> {
    Json(SessionResponse::from(&claims))
}

pub async fn billing_status(
    State(state): State<AppState>,
    Extension(claims): Extension<SessionClaims>,
) -> Result<Json<BillingStatus>> {
    state
        .store
        .billing_status(claims.tid)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("No billing record".to_string()))
}

/// Token from `Authorization: Bearer ..` or the session cookie
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        return value
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
}
