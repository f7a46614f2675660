//! Client-side session management for the OpsDesk operations console.
//!
//! This crate owns the access/refresh token lifecycle and the authenticated
//! request pipeline that every other part of the console goes through:
//!
//! - [`CredentialStore`]: the single reader/writer of persisted token state
//! - [`SessionManager`]: login, logout, and single-flight token refresh
//! - [`ApiClient`]: a request wrapper that attaches credentials and self-heals
//!   exactly one expired-token failure per call
//!
//! Dashboards and forms depend only on this surface; they never touch the
//! token pair or the refresh endpoint directly.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{retry_with_backoff, ApiClient, ApiError, RetryPolicy};
pub use auth::{
    CredentialStore, FileStorage, KeyringStorage, TokenPair, TokenStorage,
};
pub use auth::{AuthError, LoginSession, RefreshOutcome, SessionManager};
pub use config::Config;
