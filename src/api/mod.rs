//! Authenticated transport for the OpsDesk API.
//!
//! This module provides:
//! - `ApiClient`: the request wrapper every outbound call goes through,
//!   attaching credentials and self-healing one expired-token failure
//! - `ApiError`: the error taxonomy callers render
//! - `retry_with_backoff`: bounded retry for rate-limited requests

pub mod error;
pub mod retry;
pub mod transport;

pub use error::ApiError;
pub use retry::{retry_with_backoff, RetryPolicy};
pub use transport::ApiClient;
