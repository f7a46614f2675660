//! Session orchestration: login, logout, and token refresh.
//!
//! The manager is the only writer of the credential store and the only place
//! a refresh round-trip is issued. Concurrent callers that hit an expired
//! token all await one shared in-flight refresh, so a burst of API calls
//! triggered by a single expiry costs exactly one network call.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::store::CredentialStore;
use crate::auth::token::{self, TokenPair};
use crate::config::Config;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Login rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Server returned a malformed access token")]
    MalformedToken,

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    fn from_transport(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AuthError::Timeout
        } else {
            AuthError::Network(e)
        }
    }
}

/// Result of a login: the server's user payload plus the computed expiry.
/// Domain code decides what the user object means; we pass it through.
#[derive(Debug, Clone)]
pub struct LoginSession {
    pub user: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Outcome every caller of a shared refresh receives.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub success: bool,
    pub access_token: Option<String>,
}

impl RefreshOutcome {
    fn failure() -> Self {
        Self {
            success: false,
            access_token: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    user: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
}

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Owns the session lifecycle. One instance per application root, shared via
/// `Arc`; there is no global singleton.
pub struct SessionManager {
    http: reqwest::Client,
    store: Arc<CredentialStore>,
    config: Config,
    last_login: Mutex<Option<DateTime<Utc>>>,
    /// The at-most-one in-flight refresh, tagged with a generation so the
    /// caller that observes it settle can clear exactly this entry.
    inflight: Mutex<Option<(u64, SharedRefresh)>>,
    refresh_generation: AtomicU64,
    consecutive_refresh_failures: AtomicU32,
    logout_handler: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl SessionManager {
    pub fn new(config: Config, store: Arc<CredentialStore>) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(AuthError::Network)?;

        Ok(Self {
            http,
            store,
            config,
            last_login: Mutex::new(None),
            inflight: Mutex::new(None),
            refresh_generation: AtomicU64::new(0),
            consecutive_refresh_failures: AtomicU32::new(0),
            logout_handler: Mutex::new(None),
        })
    }

    /// Hook invoked after `logout` clears the session. The console wires its
    /// navigation-to-login here; the manager itself knows nothing about views.
    pub fn set_logout_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        *lock(&self.logout_handler) = Some(Box::new(handler));
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// The underlying HTTP client. Clone is cheap - reqwest::Client uses Arc
    /// internally for connection pooling.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn peek(&self) -> Option<TokenPair> {
        self.store.peek()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Authenticate and establish a session.
    ///
    /// A malformed access token from the server is rejected as its own error
    /// rather than silently accepted. Nothing is written on any failure path.
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginSession, AuthError> {
        let url = format!("{}/auth/login", self.config.api_base_url);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(AuthError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected { status, message });
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        if !token::is_well_formed_token(&body.access_token) {
            return Err(AuthError::MalformedToken);
        }

        let ttl = body.expires_in.unwrap_or(self.config.default_token_ttl_secs);
        let expires_at = expiry_from_ttl(ttl)
            .ok_or_else(|| AuthError::InvalidResponse(format!("expires_in out of range: {ttl}")))?;
        let pair = TokenPair {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
        };
        self.store.save(pair);
        *lock(&self.last_login) = Some(Utc::now());
        self.consecutive_refresh_failures.store(0, Ordering::Relaxed);
        debug!(ttl, "Login succeeded");

        Ok(LoginSession {
            user: body.user,
            expires_at,
        })
    }

    /// Drop the session. Never fails; the logout hook runs after all token
    /// state is gone.
    pub fn logout(&self) {
        self.store.clear();
        *lock(&self.last_login) = None;
        self.consecutive_refresh_failures.store(0, Ordering::Relaxed);
        debug!("Session cleared");

        if let Some(handler) = lock(&self.logout_handler).as_ref() {
            handler();
        }
    }

    /// Gatekeeper called before every authenticated operation.
    ///
    /// Within the post-login grace window this returns true without looking
    /// at expiry at all; a just-issued token can appear expired purely from
    /// clock skew between issuance and first use.
    pub async fn ensure_valid(&self) -> bool {
        if self.within_login_grace() {
            return true;
        }
        if self.store.peek().is_none() {
            return false;
        }
        if !self.store.is_expired() {
            return true;
        }
        self.refresh().await.success
    }

    fn within_login_grace(&self) -> bool {
        lock(&self.last_login)
            .map(|at| Utc::now() - at < self.config.login_grace())
            .unwrap_or(false)
    }

    /// Refresh the token pair, sharing one network call among all concurrent
    /// callers.
    ///
    /// The first caller to find no refresh in flight becomes the leader and
    /// installs a shared future; everyone else attaches to it. The slot is
    /// cleared unconditionally once the future settles, so the next expiry
    /// starts a fresh attempt. On failure the expired pair is retained: a
    /// transient backend hiccup should degrade the session, not end it.
    pub async fn refresh(&self) -> RefreshOutcome {
        let (generation, shared) = {
            let mut inflight = lock(&self.inflight);
            match inflight.as_ref() {
                Some((generation, shared)) => (*generation, shared.clone()),
                None => {
                    let generation = self.refresh_generation.fetch_add(1, Ordering::Relaxed);
                    let shared = perform_refresh(
                        self.http.clone(),
                        self.config.api_base_url.clone(),
                        self.config.default_token_ttl_secs,
                        Arc::clone(&self.store),
                    )
                    .boxed()
                    .shared();
                    *inflight = Some((generation, shared.clone()));
                    (generation, shared)
                }
            }
        };

        let outcome = shared.await;

        // Whichever caller clears the settled slot does the failure
        // bookkeeping, so one refresh counts once no matter how many waiters
        // it had.
        let cleared = {
            let mut inflight = lock(&self.inflight);
            if inflight.as_ref().is_some_and(|(g, _)| *g == generation) {
                *inflight = None;
                true
            } else {
                false
            }
        };
        if cleared {
            self.note_refresh_outcome(&outcome);
        }

        outcome
    }

    fn note_refresh_outcome(&self, outcome: &RefreshOutcome) {
        if outcome.success {
            self.consecutive_refresh_failures.store(0, Ordering::Relaxed);
            return;
        }

        let failures = self
            .consecutive_refresh_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if let Some(limit) = self.config.refresh_failure_limit {
            if failures >= limit && self.store.is_expired() {
                warn!(failures, limit, "Refresh failure limit reached, logging out");
                self.logout();
            }
        }
    }
}

/// The actual refresh round-trip. Owned values only: the future outlives the
/// borrow of `&self` because followers may hold it across their own awaits.
async fn perform_refresh(
    http: reqwest::Client,
    api_base_url: String,
    default_ttl_secs: i64,
    store: Arc<CredentialStore>,
) -> RefreshOutcome {
    let Some(current) = store.peek() else {
        debug!("No session to refresh");
        return RefreshOutcome::failure();
    };
    let Some(refresh_token) = current.refresh_token.clone() else {
        debug!("No refresh token on record");
        return RefreshOutcome::failure();
    };

    let url = format!("{}/auth/refresh", api_base_url);
    let response = match http
        .post(&url)
        .json(&json!({ "refresh_token": refresh_token }))
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            warn!("Refresh request timed out");
            return RefreshOutcome::failure();
        }
        Err(e) => {
            warn!(error = %e, "Refresh request failed");
            return RefreshOutcome::failure();
        }
    };

    if !response.status().is_success() {
        warn!(status = %response.status(), "Refresh rejected by server");
        return RefreshOutcome::failure();
    }

    let body: RefreshResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to parse refresh response");
            return RefreshOutcome::failure();
        }
    };

    if !token::is_well_formed_token(&body.access_token) {
        warn!("Refresh returned a malformed access token");
        return RefreshOutcome::failure();
    }

    let ttl = body.expires_in.unwrap_or(default_ttl_secs);
    let Some(expires_at) = expiry_from_ttl(ttl) else {
        warn!(ttl, "Refresh returned an out-of-range expiry");
        return RefreshOutcome::failure();
    };
    let pair = TokenPair {
        access_token: body.access_token.clone(),
        // Rotation: take the server's new refresh token if it sent one,
        // otherwise keep using the prior one
        refresh_token: body.refresh_token.or(current.refresh_token),
        token_type: body.token_type.unwrap_or(current.token_type),
        expires_at,
    };
    store.save(pair);
    debug!(ttl, "Token refreshed");

    RefreshOutcome {
        success: true,
        access_token: Some(body.access_token),
    }
}

/// Turn a server-supplied TTL into an absolute expiry. `None` for values the
/// calendar cannot represent; the server decides the lifetime, not the crash
/// handler.
fn expiry_from_ttl(ttl_secs: i64) -> Option<DateTime<Utc>> {
    let ttl = Duration::try_seconds(ttl_secs)?;
    Utc::now().checked_add_signed(ttl)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
