//! Authentication module for managing the token lifecycle.
//!
//! This module provides:
//! - `TokenPair`: the access/refresh token pair with format validation
//! - `TokenStorage`: pluggable persistence (file or OS keychain)
//! - `CredentialStore`: the single reader/writer of token state
//! - `SessionManager`: login, logout, and single-flight refresh
//!
//! Token state survives process restarts and malformed credentials are purged
//! rather than ever being handed to the transport.

pub mod session;
pub mod storage;
pub mod store;
pub mod token;

pub use session::{AuthError, LoginSession, RefreshOutcome, SessionManager};
pub use storage::{FileStorage, KeyringStorage, TokenStorage};
pub use store::CredentialStore;
pub use token::TokenPair;
