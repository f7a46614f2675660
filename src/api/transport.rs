//! The authenticated request pipeline.
//!
//! Every outbound API call goes through `ApiClient`: it checks the session
//! before sending, attaches the bearer credential, and on an unauthorized
//! response performs exactly one refresh-and-retry. Callers get the final
//! response back unchanged; this layer never parses domain bodies.

use reqwest::{header, Method, Request, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::SessionManager;

use super::retry::{retry_with_backoff, RetryPolicy};
use super::ApiError;

/// API client for the OpsDesk backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    session: Arc<SessionManager>,
    retry: RetryPolicy,
}

impl ApiClient {
    /// Wrap a session. The session's HTTP client is reused so all requests
    /// share one connection pool and timeout policy.
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            http: session.http().clone(),
            session,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Start building a request that will go through [`execute`].
    ///
    /// [`execute`]: ApiClient::execute
    pub fn request(&self, method: Method, url: &str) -> reqwest::RequestBuilder {
        self.http.request(method, url)
    }

    /// Send a request with automatic credential attachment and a single
    /// refresh-and-retry on an unauthorized response.
    ///
    /// A missing or invalid session does not block the call; public surfaces
    /// legitimately run unauthenticated and the server is the authority. The
    /// retry happens at most once per call: if the server keeps answering 401
    /// with a fresh token, that response is returned as-is rather than
    /// looping. Timeouts surface as [`ApiError::Timeout`] and never trigger a
    /// refresh.
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        if !self.session.ensure_valid().await {
            debug!("Proceeding without a valid session");
        }

        // Cloned before sending so the retry carries the caller's headers and
        // body but picks up the refreshed token
        let retry_request = request.try_clone();

        let response = self.send_with_token(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(retry_request) = retry_request else {
            // Streaming bodies cannot be replayed
            return Ok(response);
        };

        let outcome = self.session.refresh().await;
        if !outcome.success {
            return Err(ApiError::Unauthorized);
        }

        debug!("Retrying once with refreshed token");
        self.send_with_token(retry_request).await
    }

    /// Attach the current access token unless the caller already set an
    /// authorization header; caller headers win on conflict.
    async fn send_with_token(&self, mut request: Request) -> Result<Response, ApiError> {
        if !request.headers().contains_key(header::AUTHORIZATION) {
            if let Some(pair) = self.session.peek() {
                let credential = format!("{} {}", pair.token_type, pair.access_token);
                match header::HeaderValue::from_str(&credential) {
                    Ok(mut value) => {
                        value.set_sensitive(true);
                        request.headers_mut().insert(header::AUTHORIZATION, value);
                    }
                    Err(e) => warn!(error = %e, "Could not encode authorization header"),
                }
            }
        }
        self.http
            .execute(request)
            .await
            .map_err(ApiError::from_transport)
    }

    /// GET a JSON resource, retrying rate-limited responses with backoff.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ApiError> {
        retry_with_backoff(
            &self.retry,
            || self.fetch_json::<T, ()>(Method::GET, url, None),
            |e| matches!(e, ApiError::RateLimited),
        )
        .await
    }

    /// POST a JSON body and parse a JSON response, retrying rate-limited
    /// responses with backoff.
    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        retry_with_backoff(
            &self.retry,
            || self.fetch_json::<T, B>(Method::POST, url, Some(body)),
            |e| matches!(e, ApiError::RateLimited),
        )
        .await
    }

    async fn fetch_json<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let mut builder = self.http.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let request = builder.build().map_err(ApiError::from_transport)?;

        let response = self.execute(request).await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &text));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("Bad JSON from {}: {}", url, e)))
    }
}
