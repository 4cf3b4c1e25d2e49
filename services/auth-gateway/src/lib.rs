// Auth Gateway Service Library
// Edge interface for the security core: registration, login and session routes

pub mod config;
pub mod database;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod state;
pub mod store;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer};

pub use state::AppState;

/// Baseline hardening headers on every response, unless a handler set its own
fn security_headers() -> [SetResponseHeaderLayer<HeaderValue>; 4] {
    [
        SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ),
        SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ),
        SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=15552000; includeSubDomains"),
        ),
    ]
}

/// Assemble all routes.
///
/// Layers, outermost first: CORS, security headers, tracing, audit. Session
/// routes additionally run `require_session`.
pub fn build_router(state: AppState, allowed_origins: Vec<HeaderValue>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([middleware::REFRESHED_TOKEN_HEADER]);

    let session_routes = Router::new()
        .route("/api/auth/session", get(handlers::session))
        .route("/api/billing/status", get(handlers::billing_status))
        .route_layer(from_fn_with_state(state.clone(), middleware::require_session));

    let [nosniff, frame_options, referrer_policy, hsts] = security_headers();

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/auth/register", post(handlers::register))
        .route("/api/auth/login", post(handlers::login))
        .merge(session_routes)
        .layer(from_fn_with_state(state.clone(), middleware::audit_requests))
        .layer(TraceLayer::new_for_http())
        .layer(nosniff)
        .layer(frame_options)
        .layer(referrer_policy)
        .layer(hsts)
        .layer(cors)
        .with_state(state)
}
