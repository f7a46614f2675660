//! The credential store: the only reader/writer of persisted token state.
//!
//! Holds an in-memory mirror of the current `TokenPair` for synchronous reads
//! on the request hot path, and keeps it in step with the durable backend.
//! Malformed pairs are rejected on the way in and purged if found already
//! stored, so the rest of the client never has to reason about bad
//! credentials.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::storage::TokenStorage;
use super::token::{self, TokenPair};

pub struct CredentialStore {
    storage: Box<dyn TokenStorage>,
    current: Mutex<Option<TokenPair>>,
}

impl CredentialStore {
    pub fn new(storage: Box<dyn TokenStorage>) -> Self {
        Self {
            storage,
            current: Mutex::new(None),
        }
    }

    /// Restore persisted state. Called once at process start.
    ///
    /// A missing record falls back to the legacy single-token format, which is
    /// migrated pre-expired so the first authenticated call refreshes it
    /// instead of trusting a token of unknown lifetime. Corrupt or malformed
    /// records are removed and treated as "no session". Returns whether a
    /// session was restored; never fails.
    pub fn load(&self) -> bool {
        match self.storage.read() {
            Ok(Some(raw)) => self.restore_record(&raw),
            Ok(None) => self.migrate_legacy(),
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                false
            }
        }
    }

    fn restore_record(&self, raw: &str) -> bool {
        match serde_json::from_str::<TokenPair>(raw) {
            Ok(pair) if pair.is_well_formed() => {
                debug!("Restored persisted session");
                *self.lock_current() = Some(pair);
                true
            }
            Ok(_) => {
                warn!("Persisted session holds a malformed token, purging");
                self.remove_record();
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse persisted session, purging");
                self.remove_record();
                false
            }
        }
    }

    fn migrate_legacy(&self) -> bool {
        let legacy = match self.storage.read_legacy() {
            Ok(Some(token)) => token,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to read legacy token");
                return false;
            }
        };

        if !token::is_well_formed_token(&legacy) {
            warn!("Legacy token is malformed, removing");
            self.remove_legacy_record();
            return false;
        }

        // Unknown lifetime: mark pre-expired to force an immediate refresh
        let pair = TokenPair {
            access_token: legacy,
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: DateTime::<Utc>::UNIX_EPOCH,
        };
        debug!("Migrated legacy token as pre-expired");
        self.save(pair);
        self.remove_legacy_record();
        true
    }

    /// Replace the current pair, in memory and durably.
    ///
    /// A pair with a malformed access token is rejected with a log line and
    /// the prior state is left untouched. This function never fails; a
    /// rejected save must not crash a caller mid-login.
    pub fn save(&self, mut pair: TokenPair) {
        if !pair.is_well_formed() {
            warn!("Rejected save of malformed access token");
            return;
        }

        // A placeholder refresh token is as useless as none at all
        if pair
            .refresh_token
            .as_deref()
            .is_some_and(token::is_placeholder)
        {
            debug!("Dropping placeholder refresh token");
            pair.refresh_token = None;
        }

        match serde_json::to_string(&pair) {
            Ok(contents) => {
                if let Err(e) = self.storage.write(&contents) {
                    warn!(error = %e, "Failed to persist session");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize session"),
        }
        *self.lock_current() = Some(pair);
    }

    /// Remove all token state, in memory and durably. Idempotent.
    pub fn clear(&self) {
        *self.lock_current() = None;
        self.remove_record();
        self.remove_legacy_record();
    }

    /// Synchronous read of the current pair; no I/O.
    pub fn peek(&self) -> Option<TokenPair> {
        self.lock_current().clone()
    }

    /// No pair counts as expired.
    pub fn is_expired(&self) -> bool {
        self.lock_current()
            .as_ref()
            .map(TokenPair::is_expired)
            .unwrap_or(true)
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock_current().is_some()
    }

    fn remove_record(&self) {
        if let Err(e) = self.storage.remove() {
            warn!(error = %e, "Failed to remove persisted session");
        }
    }

    fn remove_legacy_record(&self) {
        if let Err(e) = self.storage.remove_legacy() {
            warn!(error = %e, "Failed to remove legacy token");
        }
    }

    fn lock_current(&self) -> std::sync::MutexGuard<'_, Option<TokenPair>> {
        // Whole-value replacement means a poisoned lock still holds a
        // consistent pair, so recover rather than propagate.
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
