//! Durable backends for the credential store.
//!
//! The store itself only moves serialized records; where they land is behind
//! the `TokenStorage` trait. `FileStorage` keeps a JSON file in the cache
//! directory, `KeyringStorage` keeps the same record in the OS keychain.
//! Both also understand the legacy single-token format written by old
//! releases so it can be migrated and deleted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use keyring::Entry;

/// Session file name in the cache directory (the well-known storage key)
const SESSION_FILE: &str = "session.json";

/// Legacy file holding a bare access token, pre token-pair releases
const LEGACY_TOKEN_FILE: &str = "token";

/// Keychain service name
const SERVICE_NAME: &str = "opsdesk";

/// Keychain account for the current session record
const SESSION_ENTRY: &str = "session";

/// Keychain account used by the legacy single-token format
const LEGACY_TOKEN_ENTRY: &str = "token";

/// Persistence seam for the credential store.
///
/// `read`/`write`/`remove` move the serialized session record; the legacy
/// methods expose the old single-token format for one-time migration.
pub trait TokenStorage: Send + Sync {
    fn read(&self) -> Result<Option<String>>;
    fn write(&self, contents: &str) -> Result<()>;
    fn remove(&self) -> Result<()>;

    fn read_legacy(&self) -> Result<Option<String>>;
    fn remove_legacy(&self) -> Result<()>;
}

/// File-backed storage under a cache directory.
pub struct FileStorage {
    cache_dir: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }

    fn legacy_path(&self) -> PathBuf {
        self.cache_dir.join(LEGACY_TOKEN_FILE)
    }

    fn read_file(&self, path: &PathBuf) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(contents))
    }

    fn remove_file(&self, path: &PathBuf) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

impl TokenStorage for FileStorage {
    fn read(&self) -> Result<Option<String>> {
        self.read_file(&self.session_path())
    }

    fn write(&self, contents: &str) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn remove(&self) -> Result<()> {
        self.remove_file(&self.session_path())
    }

    fn read_legacy(&self) -> Result<Option<String>> {
        // Legacy file holds the raw token with optional trailing newline
        Ok(self
            .read_file(&self.legacy_path())?
            .map(|raw| raw.trim().to_string()))
    }

    fn remove_legacy(&self) -> Result<()> {
        self.remove_file(&self.legacy_path())
    }
}

/// OS keychain storage via the `keyring` crate.
pub struct KeyringStorage;

impl KeyringStorage {
    pub fn new() -> Self {
        Self
    }

    fn entry(account: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, account).context("Failed to create keyring entry")
    }

    fn read_entry(account: &str) -> Result<Option<String>> {
        match Self::entry(account)?.get_password() {
            Ok(contents) => Ok(Some(contents)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to read from keychain"),
        }
    }

    fn remove_entry(account: &str) -> Result<()> {
        match Self::entry(account)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete keychain entry"),
        }
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStorage for KeyringStorage {
    fn read(&self) -> Result<Option<String>> {
        Self::read_entry(SESSION_ENTRY)
    }

    fn write(&self, contents: &str) -> Result<()> {
        Self::entry(SESSION_ENTRY)?
            .set_password(contents)
            .context("Failed to store session in keychain")
    }

    fn remove(&self) -> Result<()> {
        Self::remove_entry(SESSION_ENTRY)
    }

    fn read_legacy(&self) -> Result<Option<String>> {
        Self::read_entry(LEGACY_TOKEN_ENTRY)
    }

    fn remove_legacy(&self) -> Result<()> {
        Self::remove_entry(LEGACY_TOKEN_ENTRY)
    }
}
