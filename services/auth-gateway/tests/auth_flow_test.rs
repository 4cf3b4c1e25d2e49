// Integration tests for the auth gateway
// Drives the router in-process against the in-memory store

use auth_gateway::{
    build_router, handlers::SESSION_COOKIE, middleware::REFRESHED_TOKEN_HEADER,
    store::{CredentialStore, InMemoryStore},
    AppState,
};
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderValue, Method, Request, StatusCode},
    response::Response,
    Router,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use security_core::{
    AuditSink, EncryptedBlob, HasherConfig, MemorySink, RiskLevel, Role, SecurityConfig,
    SinkConfig,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;

const PASSWORD: &str = "Sn0wfl@ke!";
const EMAIL: &str = "owner@acme.io";
const TAX_ID: &str = "12.345.678/0001-90";

struct TestApp {
    router: Router,
    state: AppState,
    store: Arc<InMemoryStore>,
    sink: Arc<MemorySink>,
}

fn security_config(pii_encryption_enabled: bool) -> SecurityConfig {
    let mut config = SecurityConfig::default();
    config.vault.key = Some("00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff".into());
    config.vault.pii_encryption_enabled = pii_encryption_enabled;
    config.token.secret = Some("integration-test-secret-0123456789abcdef".into());
    config.hasher = HasherConfig {
        memory_cost_kib: 256,
        time_cost: 1,
        parallelism: 1,
        ..HasherConfig::default()
    };
    config.audit.sink = SinkConfig::Memory;
    config
}

fn spawn_app(pii_encryption_enabled: bool) -> TestApp {
    let config = security_config(pii_encryption_enabled);
    let keys = config.resolve_keys().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let sink = Arc::new(MemorySink::new());

    let state = AppState::new(
        &config,
        &keys,
        store.clone(),
        sink.clone() as Arc<dyn AuditSink>,
    )
    .unwrap();
    let router = build_router(
        state.clone(),
        vec![HeaderValue::from_static("http://localhost:5173")],
    );

    TestApp {
        router,
        state,
        store,
        sink,
    }
}

fn request(method: Method, uri: &str, peer: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::USER_AGENT, "integration-test/1.0")
        .header(header::CONTENT_TYPE, "application/json");
    let mut req = match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let addr: SocketAddr = format!("{}:40000", peer).parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

fn with_bearer(mut req: Request<Body>, token: &str) -> Request<Body> {
    req.headers_mut().insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
    req
}

async fn send(app: &TestApp, req: Request<Body>) -> Response {
    app.router.clone().oneshot(req).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn registration(email: &str, password: &str) -> Value {
    json!({
        "companyName": "Acme Ltda",
        "email": email,
        "password": password,
        "plan": "pro",
        "taxId": TAX_ID,
        "businessSize": "small",
        "sector": "retail",
        "storageType": "cloud",
    })
}

async fn register(app: &TestApp, email: &str, password: &str) -> Response {
    send(
        app,
        request(
            Method::POST,
            "/api/auth/register",
            "10.0.0.1",
            Some(registration(email, password)),
        ),
    )
    .await
}

async fn login(app: &TestApp, peer: &str, email: &str, password: &str) -> Response {
    send(
        app,
        request(
            Method::POST,
            "/api/auth/login",
            peer,
            Some(json!({ "email": email, "password": password })),
        ),
    )
    .await
}

#[tokio::test]
async fn test_register_login_and_throttle() {
    let app = spawn_app(true);

    // Registration stores neither the password nor the tax id in plaintext
    let response = register(&app, EMAIL, PASSWORD).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let tenant_id = body_json(response).await["tenantId"].as_u64().unwrap();

    let stored = app.store.password_hash(EMAIL).unwrap();
    assert!(!stored.contains(PASSWORD));
    assert!(stored.starts_with("$argon2id$"));

    let blob: EncryptedBlob = app.store.protected_tax_id(tenant_id).unwrap();
    assert!(!blob.as_str().contains(TAX_ID));
    assert_eq!(app.state.vault.decrypt_str(&blob).unwrap(), TAX_ID);

    // Login yields a 15 minute token and a hardened cookie
    let response = login(&app, "10.0.0.1", EMAIL, PASSWORD).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
    assert!(cookie.starts_with(&format!("{}=", SESSION_COOKIE)));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("Secure"));
    assert!(cookie.contains("SameSite=Strict"));

    let body = body_json(response).await;
    assert_eq!(body["user"]["email"], EMAIL);
    assert_eq!(body["user"]["role"], "admin");
    let token = body["token"].as_str().unwrap();
    let claims = app.state.issuer.validate(token).unwrap();
    assert_eq!(claims.exp - claims.iat, 900);
    assert_eq!(claims.tid, tenant_id);

    // Five wrong passwords from one address, then the sixth attempt is throttled
    for _ in 0..5 {
        let response = login(&app, "10.0.0.66", EMAIL, "wrong-password").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    let response = login(&app, "10.0.0.66", EMAIL, PASSWORD).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
    assert!(body_json(response).await["error"]
        .as_str()
        .unwrap()
        .contains("Try again"));

    // Another address is unaffected
    let response = login(&app, "10.0.0.2", EMAIL, PASSWORD).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_email_and_wrong_password_look_identical() {
    let app = spawn_app(true);
    register(&app, EMAIL, PASSWORD).await;

    let unknown = login(&app, "10.0.1.1", "nobody@acme.io", PASSWORD).await;
    let wrong = login(&app, "10.0.1.2", EMAIL, "not-the-password").await;

    assert_eq!(unknown.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(unknown).await["error"],
        body_json(wrong).await["error"]
    );
}

#[tokio::test]
async fn test_registration_validation() {
    let app = spawn_app(true);

    assert_eq!(
        register(&app, EMAIL, "short").await.status(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        register(&app, "", PASSWORD).await.status(),
        StatusCode::BAD_REQUEST
    );

    assert_eq!(register(&app, EMAIL, PASSWORD).await.status(), StatusCode::CREATED);
    assert_eq!(
        register(&app, "  OWNER@acme.io ", PASSWORD).await.status(),
        StatusCode::CONFLICT
    );
    assert_eq!(app.store.user_count(), 1);

    let response = send(
        &app,
        request(Method::POST, "/api/auth/register", "10.0.0.1", None),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_pii_not_stored_when_encryption_disabled() {
    let app = spawn_app(false);
    let response = register(&app, EMAIL, PASSWORD).await;
    let tenant_id = body_json(response).await["tenantId"].as_u64().unwrap();

    assert!(app.store.protected_tax_id(tenant_id).is_none());
    assert!(app.store.company(tenant_id).is_some());
}

#[tokio::test]
async fn test_session_routes_require_valid_token() {
    let app = spawn_app(true);
    register(&app, EMAIL, PASSWORD).await;
    let token = body_json(login(&app, "10.0.2.1", EMAIL, PASSWORD).await).await["token"]
        .as_str()
        .unwrap()
        .to_string();

    // No token
    let response = send(&app, request(Method::GET, "/api/auth/session", "10.0.2.1", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Tampered token
    let mut tampered = token.clone();
    tampered.push('x');
    let response = send(
        &app,
        with_bearer(
            request(Method::GET, "/api/auth/session", "10.0.2.1", None),
            &tampered,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "Unauthorized");

    // Bearer
    let response = send(
        &app,
        with_bearer(request(Method::GET, "/api/auth/session", "10.0.2.1", None), &token),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(REFRESHED_TOKEN_HEADER).is_none());
    assert_eq!(body_json(response).await["role"], "admin");

    // Cookie
    let mut req = request(Method::GET, "/api/billing/status", "10.0.2.1", None);
    req.headers_mut().insert(
        header::COOKIE,
        HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, token)).unwrap(),
    );
    let response = send(&app, req).await;
    assert_eq!(response.status(), StatusCode::OK);
    let billing = body_json(response).await;
    assert_eq!(billing["status"], "Active");
    assert_eq!(billing["active"], true);
    assert_eq!(billing["plan"], "pro");
}

#[tokio::test]
async fn test_near_expiry_token_is_refreshed() {
    let app = spawn_app(true);
    let response = register(&app, EMAIL, PASSWORD).await;
    let tenant_id = body_json(response).await["tenantId"].as_u64().unwrap();
    let subject_id = app
        .store
        .find_credential_by_identity(EMAIL)
        .await
        .unwrap()
        .unwrap()
        .subject_id;

    // Issued eleven minutes ago: four minutes left
    let old = app
        .state
        .issuer
        .issue_at(subject_id, tenant_id, Role::Admin, Utc::now() - Duration::minutes(11))
        .unwrap();

    let response = send(
        &app,
        with_bearer(
            request(Method::GET, "/api/auth/session", "10.0.3.1", None),
            &old.token,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let refreshed = response.headers()[REFRESHED_TOKEN_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    let claims = app.state.issuer.validate(&refreshed).unwrap();
    assert!(claims.exp > old.claims.exp);
    assert_eq!(claims.exp - claims.iat, 900);

    // The presented token keeps working until its own expiry
    let response = send(
        &app,
        with_bearer(
            request(Method::GET, "/api/auth/session", "10.0.3.1", None),
            &old.token,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    // A demoted account is refreshed with its current role
    app.store.set_role(subject_id, Role::Staff);
    let response = send(
        &app,
        with_bearer(
            request(Method::GET, "/api/auth/session", "10.0.3.1", None),
            &old.token,
        ),
    )
    .await;
    let refreshed = response.headers()[REFRESHED_TOKEN_HEADER]
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(app.state.issuer.validate(&refreshed).unwrap().role, Role::Staff);

    // A disabled account gets no refresh
    app.store.set_active(subject_id, false);
    let response = send(
        &app,
        with_bearer(
            request(Method::GET, "/api/auth/session", "10.0.3.1", None),
            &old.token,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(REFRESHED_TOKEN_HEADER).is_none());
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let app = spawn_app(true);
    let expired = app
        .state
        .issuer
        .issue_at(1, 1, Role::Admin, Utc::now() - Duration::minutes(16))
        .unwrap();

    let response = send(
        &app,
        with_bearer(
            request(Method::GET, "/api/billing/status", "10.0.4.1", None),
            &expired.token,
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_requests_are_audited_with_risk() {
    let app = spawn_app(true);
    register(&app, EMAIL, PASSWORD).await;
    login(&app, "10.0.5.1", EMAIL, "wrong-password").await;
    let token = body_json(login(&app, "10.0.5.1", EMAIL, PASSWORD).await).await["token"]
        .as_str()
        .unwrap()
        .to_string();
    send(
        &app,
        with_bearer(request(Method::GET, "/api/auth/session", "10.0.5.1", None), &token),
    )
    .await;
    send(&app, request(Method::GET, "/nowhere", "10.0.5.1", None)).await;

    app.state.audit.shutdown().await;
    let events = app.sink.events().await;
    assert_eq!(events.len(), 5);
    assert_eq!(app.state.audit.dropped_count(), 0);

    let outcomes: Vec<(&str, u16, RiskLevel)> = events
        .iter()
        .map(|e| (e.action.as_str(), e.status, e.risk_level()))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("POST /api/auth/register", 201, RiskLevel::Low),
            ("POST /api/auth/login", 401, RiskLevel::High),
            ("POST /api/auth/login", 200, RiskLevel::Low),
            ("GET /api/auth/session", 200, RiskLevel::Low),
            ("GET /nowhere", 404, RiskLevel::Medium),
        ]
    );

    assert!(events[1].actor_id.is_none());
    assert_eq!(events[1].reason.as_deref(), Some("invalid_credentials"));
    assert_eq!(events[2].reason, None);
    assert_eq!(events[4].reason.as_deref(), None);
    assert!(events[2].actor_id.is_some());
    assert_eq!(events[3].actor_id, events[2].actor_id);
    assert!(events[1..]
        .iter()
        .all(|e| e.source_addr.as_deref() == Some("10.0.5.1")
            && e.user_agent.as_deref() == Some("integration-test/1.0")));
}

#[tokio::test]
async fn test_health_and_metrics() {
    let app = spawn_app(true);

    let response = send(&app, request(Method::GET, "/health", "10.0.6.1", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");

    register(&app, EMAIL, PASSWORD).await;
    login(&app, "10.0.6.1", EMAIL, PASSWORD).await;

    let response = send(&app, request(Method::GET, "/metrics", "10.0.6.1", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("security_tokens_issued_total"));
}

#[tokio::test]
async fn test_cors_exposes_refresh_header() {
    let app = spawn_app(true);
    let mut req = request(Method::GET, "/health", "10.0.7.1", None);
    req.headers_mut().insert(
        header::ORIGIN,
        HeaderValue::from_static("http://localhost:5173"),
    );

    let response = send(&app, req).await;
    let headers = response.headers();
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:5173"
    );
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    assert!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS]
        .to_str()
        .unwrap()
        .contains("x-refreshed-token"));
}

#[tokio::test]
async fn test_token_rejections_audited_with_reason() {
    let app = spawn_app(true);
    let issuer = &app.state.issuer;

    let expired = issuer
        .issue_at(1, 1, Role::Admin, Utc::now() - Duration::minutes(16))
        .unwrap()
        .token;
    let valid = issuer.issue(1, 1, Role::Staff).unwrap().token;
    let other = issuer.issue(2, 1, Role::Admin).unwrap().token;

    let payload = valid.split('.').nth(1).unwrap();
    let none_header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let unsigned = format!("{}.{}.", none_header, payload);

    let other_parts: Vec<&str> = other.split('.').collect();
    let spliced = format!("{}.{}.{}", other_parts[0], payload, other_parts[2]);

    for token in [&expired, &unsigned, &spliced] {
        let response = send(
            &app,
            with_bearer(request(Method::GET, "/api/auth/session", "10.0.8.1", None), token),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        // Clients cannot tell the causes apart
        assert_eq!(body_json(response).await["error"], "Unauthorized");
    }
    let response = send(&app, request(Method::GET, "/api/auth/session", "10.0.8.1", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    app.state.audit.shutdown().await;
    let events = app.sink.events().await;
    let reasons: Vec<Option<&str>> = events.iter().map(|e| e.reason.as_deref()).collect();
    assert_eq!(
        reasons,
        vec![
            Some("token_expired"),
            Some("token_algorithm_mismatch"),
            Some("token_signature_invalid"),
            Some("token_missing"),
        ]
    );
    assert!(events.iter().all(|e| e.status == 401
        && e.risk_level() == RiskLevel::High
        && e.actor_id.is_none()
        && e.verify_hash()));
}

#[tokio::test]
async fn test_unreadable_password_record_rejected_like_wrong_password() {
    let app = spawn_app(true);
    register(&app, EMAIL, PASSWORD).await;
    let subject_id = app
        .store
        .find_credential_by_identity(EMAIL)
        .await
        .unwrap()
        .unwrap()
        .subject_id;
    app.store
        .update_password_hash(subject_id, "not-a-password-record".to_string())
        .await
        .unwrap();

    let unreadable = login(&app, "10.0.9.1", EMAIL, PASSWORD).await;
    let unknown = login(&app, "10.0.9.2", "nobody@acme.io", PASSWORD).await;

    assert_eq!(unreadable.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        body_json(unreadable).await["error"],
        body_json(unknown).await["error"]
    );
}

#[tokio::test]
async fn test_security_headers_on_every_response() {
    let app = spawn_app(true);

    let ok = send(&app, request(Method::GET, "/health", "10.0.10.1", None)).await;
    let denied = send(&app, request(Method::GET, "/api/auth/session", "10.0.10.1", None)).await;
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

    for response in [ok, denied] {
        let headers = response.headers();
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::REFERRER_POLICY], "no-referrer");
        assert!(headers.contains_key(header::STRICT_TRANSPORT_SECURITY));
    }
}
