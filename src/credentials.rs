//! Credential secure-store with one-shot legacy plaintext migration (§2a, §6).

use std::path::{Path, PathBuf};

use keyring::Entry;
use log::{info, warn};
use serde::{Deserialize, Serialize};

const SERVICE_NAME: &str = "subsonic-playback-core";

/// Server endpoint and login credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub server_url: String,
    pub username: String,
    pub password: String,
}

fn keyring_entry(username: &str) -> Result<Entry, String> {
    Entry::new(SERVICE_NAME, username)
        .map_err(|err| format!("failed to create keyring entry for '{username}': {err}"))
}

/// Saves credentials into the OS secret store. The server URL and username are embedded
/// alongside the password so a single secret recovers the full `Credentials` value.
pub fn save(credentials: &Credentials) -> Result<(), String> {
    let entry = keyring_entry(&credentials.username)?;
    let payload = serde_json::to_string(credentials)
        .map_err(|err| format!("failed to serialize credentials: {err}"))?;
    entry
        .set_password(&payload)
        .map_err(|err| format!("failed to save credentials in keyring: {err}"))
}

/// Loads credentials previously stored under `username`.
pub fn load(username: &str) -> Result<Option<Credentials>, String> {
    let entry = keyring_entry(username)?;
    match entry.get_password() {
        Ok(payload) => serde_json::from_str(&payload)
            .map(Some)
            .map_err(|err| format!("failed to parse stored credentials: {err}")),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(err) => Err(format!("failed to load credentials from keyring: {err}")),
    }
}

pub fn delete(username: &str) -> Result<(), String> {
    let entry = keyring_entry(username)?;
    match entry.delete_password() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(err) => Err(format!("failed to delete credentials from keyring: {err}")),
    }
}

fn legacy_path(data_dir: &Path) -> PathBuf {
    data_dir.join("credentials.toml")
}

/// One-shot, idempotent migration of a legacy plaintext `credentials.toml` into the secure
/// store. Safe to call on every startup: once the legacy file is gone this is a no-op.
pub fn migrate_legacy_plaintext(data_dir: &Path) {
    let path = legacy_path(data_dir);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => return,
    };
    let credentials: Credentials = match toml::from_str(&raw) {
        Ok(credentials) => credentials,
        Err(err) => {
            warn!(
                "Credentials: legacy file {} is unreadable ({err}); leaving it in place",
                path.display()
            );
            return;
        }
    };
    match save(&credentials) {
        Ok(()) => {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(
                    "Credentials: migrated legacy credentials but failed to remove {}: {err}",
                    path.display()
                );
            } else {
                info!("Credentials: migrated legacy plaintext credentials into the secure store");
            }
        }
        Err(err) => warn!("Credentials: failed to migrate legacy credentials: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_is_noop_without_legacy_file() {
        let dir = std::env::temp_dir().join("playback-core-credentials-test-noop");
        let _ = std::fs::create_dir_all(&dir);
        migrate_legacy_plaintext(&dir);
        assert!(!legacy_path(&dir).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
