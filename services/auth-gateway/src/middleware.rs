// Session and audit middleware

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use security_core::AuditEvent;
use std::net::SocketAddr;
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::handlers::extract_token;
use crate::models::{AuditActor, AuditReason};
use crate::state::AppState;

/// Carries a replacement token when the presented one is near expiry
pub const REFRESHED_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-refreshed-token");

/// Validate the session token, expose its claims to the handler and attach a
/// refreshed token to successful responses when one is due.
///
/// The presented token stays valid until its own expiry either way.
pub async fn require_session(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = extract_token(req.headers()) else {
        return rejected(ApiError::Unauthorized, "token_missing");
    };
    let claims = match state.issuer.validate(&token) {
        Ok(claims) => claims,
        Err(e) => {
            let reason = e.kind();
            return rejected(e.into(), reason);
        }
    };

    req.extensions_mut().insert(claims.clone());
    let mut response = next.run(req).await;
    response.extensions_mut().insert(AuditActor::from(&claims));

    if response.status().is_success() {
        if let Some(refreshed) = state.issuer.maybe_refresh(&claims).await {
            match HeaderValue::from_str(&refreshed.token) {
                Ok(value) => {
                    response.headers_mut().insert(REFRESHED_TOKEN_HEADER, value);
                }
                Err(e) => warn!("Refreshed token not representable as header: {}", e),
            }
        }
    }

    response
}

/// Error response tagged with the internal reason; clients only see the error body
fn rejected(err: ApiError, reason: &'static str) -> Response {
    let mut response = err.into_response();
    response.extensions_mut().insert(AuditReason(reason));
    response
}

/// Record every request's outcome without waiting on the audit sink
pub async fn audit_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let action = format!("{} {}", req.method(), req.uri().path());
    let source = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let user_agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = next.run(req).await;

    let mut event = AuditEvent::from_outcome(action, response.status().as_u16());
    if let Some(actor) = response.extensions().get::<AuditActor>() {
        event = event.with_actor(actor.subject_id, Some(actor.tenant_id));
    }
    if let Some(source) = source {
        event = event.with_source(source);
    }
    if let Some(user_agent) = user_agent {
        event = event.with_user_agent(user_agent);
    }
    if let Some(AuditReason(reason)) = response.extensions().get::<AuditReason>() {
        event = event.with_reason(*reason);
    }

    if let Err(e) = state.audit.record(event) {
        debug!("Audit event not recorded: {}", e);
    }

    response
}
