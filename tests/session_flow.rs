//! End-to-end session and transport flows against a local stub API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Json;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use opsdesk_client::{
    ApiClient, ApiError, AuthError, Config, CredentialStore, FileStorage, SessionManager,
    TokenPair,
};

/// Bind a stub API on an ephemeral port and return its base URL.
async fn spawn_stub(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve stub");
    });
    format!("http://{}", addr)
}

/// Initialize test logging; `RUST_LOG` controls the level.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn manager_with_config(config: Config, dir: &TempDir) -> Arc<SessionManager> {
    init_tracing();
    let store = Arc::new(CredentialStore::new(Box::new(FileStorage::new(
        dir.path().to_path_buf(),
    ))));
    Arc::new(SessionManager::new(config, store).expect("session manager"))
}

fn manager(base_url: &str, dir: &TempDir) -> Arc<SessionManager> {
    manager_with_config(Config::new(base_url), dir)
}

fn expired_pair(access_token: &str) -> TokenPair {
    TokenPair {
        access_token: access_token.to_string(),
        refresh_token: Some("refresh-opaque".to_string()),
        token_type: "Bearer".to_string(),
        expires_at: Utc::now() - chrono::Duration::seconds(60),
    }
}

fn live_pair(access_token: &str) -> TokenPair {
    TokenPair {
        expires_at: Utc::now() + chrono::Duration::hours(1),
        ..expired_pair(access_token)
    }
}

fn refresh_response() -> Json<Value> {
    Json(json!({
        "access_token": "n.p.s",
        "token_type": "Bearer",
        "expires_in": 3600
    }))
}

#[tokio::test]
async fn login_establishes_session_with_computed_expiry() {
    let router = Router::new().route(
        "/auth/login",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["email"], "a@b.com");
            assert_eq!(body["password"], "x");
            Json(json!({
                "access_token": "h.p.s",
                "refresh_token": "refresh-opaque",
                "token_type": "Bearer",
                "expires_in": 3600,
                "user": { "email": "a@b.com", "name": "Ada" }
            }))
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    let login = session.login("a@b.com", "x").await.expect("login");
    assert_eq!(login.user["name"], "Ada");
    assert!(session.is_authenticated());

    let pair = session.peek().expect("pair stored");
    assert_eq!(pair.access_token, "h.p.s");
    let ttl = pair.seconds_until_expiry();
    assert!((3590..=3610).contains(&ttl), "expiry ~3600s out, got {ttl}");
}

#[tokio::test]
async fn login_rejects_malformed_server_token_without_writing() {
    let router = Router::new().route(
        "/auth/login",
        post(|| async {
            Json(json!({ "access_token": "not-a-signed-token", "expires_in": 3600 }))
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    let err = session.login("a@b.com", "x").await.expect_err("must fail");
    assert!(matches!(err, AuthError::MalformedToken));
    assert!(!session.is_authenticated(), "no partial writes on failure");
}

#[tokio::test]
async fn login_rejects_unrepresentable_expiry() {
    let router = Router::new().route(
        "/auth/login",
        post(|| async {
            Json(json!({ "access_token": "h.p.s", "expires_in": i64::MAX }))
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    let err = session.login("a@b.com", "x").await.expect_err("must fail");
    assert!(matches!(err, AuthError::InvalidResponse(_)));
    assert!(!session.is_authenticated(), "no partial writes on failure");
}

#[tokio::test]
async fn refresh_with_unrepresentable_expiry_degrades() {
    let router = Router::new().route(
        "/auth/refresh",
        post(|| async {
            Json(json!({ "access_token": "n.p.s", "expires_in": i64::MAX }))
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    let pair = expired_pair("h.p.s");
    session.store().save(pair.clone());

    let outcome = session.refresh().await;
    assert!(!outcome.success);
    assert_eq!(session.peek(), Some(pair), "expired pair retained, not purged");
}

#[tokio::test]
async fn login_failure_is_structured_not_a_panic() {
    let router = Router::new().route(
        "/auth/login",
        post(|| async { (StatusCode::UNAUTHORIZED, "bad credentials") }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    let err = session.login("a@b.com", "wrong").await.expect_err("must fail");
    match err {
        AuthError::Rejected { status, .. } => assert_eq!(status, 401),
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn grace_period_covers_a_token_that_looks_expired() {
    let refresh_calls = Arc::new(AtomicU32::new(0));
    let refresh_counter = Arc::clone(&refresh_calls);

    let router = Router::new()
        .route(
            "/auth/login",
            post(|| async {
                // Clock skew in miniature: the token arrives already expired
                Json(json!({
                    "access_token": "h.p.s",
                    "refresh_token": "refresh-opaque",
                    "expires_in": -60,
                    "user": {}
                }))
            }),
        )
        .route(
            "/auth/refresh",
            post(move || {
                let refresh_counter = Arc::clone(&refresh_counter);
                async move {
                    refresh_counter.fetch_add(1, Ordering::Relaxed);
                    refresh_response()
                }
            }),
        );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    session.login("a@b.com", "x").await.expect("login");
    assert!(session.store().is_expired(), "precondition: token already expired");

    assert!(session.ensure_valid().await);
    assert_eq!(
        refresh_calls.load(Ordering::Relaxed),
        0,
        "grace window must suppress the refresh entirely"
    );
}

#[tokio::test]
async fn concurrent_expiry_triggers_a_single_refresh() {
    let refresh_calls = Arc::new(AtomicU32::new(0));
    let refresh_counter = Arc::clone(&refresh_calls);

    let router = Router::new().route(
        "/auth/refresh",
        post(move || {
            let refresh_counter = Arc::clone(&refresh_counter);
            async move {
                refresh_counter.fetch_add(1, Ordering::Relaxed);
                // Long enough for every caller to pile up behind it
                tokio::time::sleep(Duration::from_millis(200)).await;
                refresh_response()
            }
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);
    session.store().save(expired_pair("h.p.s"));

    let (a, b, c, d, e) = tokio::join!(
        session.ensure_valid(),
        session.ensure_valid(),
        session.ensure_valid(),
        session.ensure_valid(),
        session.ensure_valid(),
    );
    assert!(a && b && c && d && e, "all callers share the same outcome");
    assert_eq!(refresh_calls.load(Ordering::Relaxed), 1);

    let pair = session.peek().expect("refreshed pair");
    assert_eq!(pair.access_token, "n.p.s");
}

#[tokio::test]
async fn refresh_honors_rotation_and_retains_prior_refresh_token() {
    // First refresh rotates the refresh token, second omits it
    let refresh_calls = Arc::new(AtomicU32::new(0));
    let refresh_counter = Arc::clone(&refresh_calls);

    let router = Router::new().route(
        "/auth/refresh",
        post(move || {
            let refresh_counter = Arc::clone(&refresh_counter);
            async move {
                let call = refresh_counter.fetch_add(1, Ordering::Relaxed);
                if call == 0 {
                    Json(json!({
                        "access_token": "n.p.s",
                        "refresh_token": "rotated",
                        "expires_in": -1
                    }))
                } else {
                    refresh_response()
                }
            }
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);
    session.store().save(expired_pair("h.p.s"));

    assert!(session.refresh().await.success);
    assert_eq!(
        session.peek().expect("pair").refresh_token.as_deref(),
        Some("rotated")
    );

    // Still expired (expires_in: -1), so this refreshes again; the server
    // sends no new refresh token and the rotated one must survive
    assert!(session.refresh().await.success);
    assert_eq!(
        session.peek().expect("pair").refresh_token.as_deref(),
        Some("rotated")
    );
}

#[tokio::test]
async fn persistent_401_costs_exactly_two_calls() {
    let data_calls = Arc::new(AtomicU32::new(0));
    let data_counter = Arc::clone(&data_calls);
    let refresh_calls = Arc::new(AtomicU32::new(0));
    let refresh_counter = Arc::clone(&refresh_calls);

    let router = Router::new()
        .route(
            "/proposals",
            get(move || {
                let data_counter = Arc::clone(&data_counter);
                async move {
                    data_counter.fetch_add(1, Ordering::Relaxed);
                    StatusCode::UNAUTHORIZED
                }
            }),
        )
        .route(
            "/auth/refresh",
            post(move || {
                let refresh_counter = Arc::clone(&refresh_counter);
                async move {
                    refresh_counter.fetch_add(1, Ordering::Relaxed);
                    refresh_response()
                }
            }),
        );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);
    session.store().save(live_pair("h.p.s"));

    let api = ApiClient::new(Arc::clone(&session));
    let result: Result<Value, _> = api.get_json(&format!("{}/proposals", base)).await;

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert_eq!(
        data_calls.load(Ordering::Relaxed),
        2,
        "original call plus exactly one retry"
    );
    assert_eq!(refresh_calls.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn stale_token_heals_transparently() {
    let data_calls = Arc::new(AtomicU32::new(0));
    let data_counter = Arc::clone(&data_calls);

    let router = Router::new()
        .route(
            "/proposals",
            get(move |headers: HeaderMap| {
                let data_counter = Arc::clone(&data_counter);
                async move {
                    data_counter.fetch_add(1, Ordering::Relaxed);
                    let authorization = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if authorization == "Bearer n.p.s" {
                        (StatusCode::OK, Json(json!({ "items": [1, 2, 3] })))
                    } else {
                        (StatusCode::UNAUTHORIZED, Json(json!({})))
                    }
                }
            }),
        )
        .route("/auth/refresh", post(|| async { refresh_response() }));
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    // Unexpired locally but revoked server-side: only the post-failure
    // refresh path can heal this
    session.store().save(live_pair("revoked.p.s"));

    let api = ApiClient::new(Arc::clone(&session));
    let body: Value = api
        .get_json(&format!("{}/proposals", base))
        .await
        .expect("healed request");

    assert_eq!(body["items"], json!([1, 2, 3]));
    assert_eq!(data_calls.load(Ordering::Relaxed), 2);
    assert_eq!(session.peek().expect("pair").access_token, "n.p.s");
}

#[tokio::test]
async fn failed_refresh_degrades_but_keeps_the_session() {
    let refresh_calls = Arc::new(AtomicU32::new(0));
    let refresh_counter = Arc::clone(&refresh_calls);

    let router = Router::new().route(
        "/auth/refresh",
        post(move || {
            let refresh_counter = Arc::clone(&refresh_counter);
            async move {
                refresh_counter.fetch_add(1, Ordering::Relaxed);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);

    let pair = expired_pair("h.p.s");
    session.store().save(pair.clone());

    assert!(!session.ensure_valid().await);
    assert_eq!(session.peek(), Some(pair), "expired pair retained, not purged");

    // The in-flight slot was cleared, so the next call retries instead of
    // replaying the failed attempt
    assert!(!session.ensure_valid().await);
    assert_eq!(refresh_calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn timeout_is_not_treated_as_an_auth_failure() {
    let refresh_calls = Arc::new(AtomicU32::new(0));
    let refresh_counter = Arc::clone(&refresh_calls);

    let router = Router::new()
        .route(
            "/proposals",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        )
        .route(
            "/auth/refresh",
            post(move || {
                let refresh_counter = Arc::clone(&refresh_counter);
                async move {
                    refresh_counter.fetch_add(1, Ordering::Relaxed);
                    refresh_response()
                }
            }),
        );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let mut config = Config::new(base.as_str());
    config.request_timeout_secs = 1;
    let session = manager_with_config(config, &dir);
    session.store().save(live_pair("h.p.s"));

    let api = ApiClient::new(Arc::clone(&session));
    let result: Result<Value, _> = api.get_json(&format!("{}/proposals", base)).await;

    assert!(matches!(result, Err(ApiError::Timeout)));
    assert_eq!(
        refresh_calls.load(Ordering::Relaxed),
        0,
        "a timeout says nothing about the token"
    );
}

#[tokio::test]
async fn caller_supplied_authorization_wins() {
    let router = Router::new().route(
        "/whoami",
        get(|headers: HeaderMap| async move {
            let authorization = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            Json(json!({ "authorization": authorization }))
        }),
    );
    let base = spawn_stub(router).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let session = manager(&base, &dir);
    session.store().save(live_pair("h.p.s"));

    let api = ApiClient::new(Arc::clone(&session));
    let request = api
        .request(reqwest::Method::GET, &format!("{}/whoami", base))
        .header("authorization", "Bearer caller-chose-this")
        .build()
        .expect("build request");

    let response = api.execute(request).await.expect("execute");
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["authorization"], "Bearer caller-chose-this");
}

#[tokio::test]
async fn session_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let session = manager("http://127.0.0.1:1", &dir);
        session.store().save(live_pair("h.p.s"));
    }

    // New store over the same directory simulates a process restart
    let store = CredentialStore::new(Box::new(FileStorage::new(dir.path().to_path_buf())));
    assert!(store.load());
    assert_eq!(store.peek().expect("restored").access_token, "h.p.s");
}
