//! OS secret store access for the Claude CLI's OAuth credentials
//! - macOS: Keychain, account = current user
//! - Windows / Linux: keyring entry under the `credentials` account
//!
//! Every platform falls back to the CLI's `.credentials.json` when the entry
//! is missing, empty, or the keyring backend fails.

use keyring::Entry;
use std::path::PathBuf;

use crate::providers::credentials::{CredentialError, Result};

const FALLBACK_ACCOUNT: &str = "credentials";

/// Somewhere a raw credentials JSON document can be read from
pub trait SecretSource: Send + Sync {
    fn read(&self) -> Result<String>;
}

/// Retrieve a password from the OS keychain; a missing entry is `None`.
pub fn read_password(service: &str, account: &str) -> std::result::Result<Option<String>, keyring::Error> {
    let entry = Entry::new(service, account)?;
    match entry.get_password() {
        Ok(password) => Ok(Some(password)),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(e) => Err(e),
    }
}

fn non_empty(raw: String) -> Result<String> {
    if raw.trim().is_empty() {
        Err(CredentialError::Empty)
    } else {
        Ok(raw)
    }
}

/// Plain JSON file as written by the CLI when no keyring is available
pub struct CredentialsFile {
    path: PathBuf,
}

impl CredentialsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SecretSource for CredentialsFile {
    fn read(&self) -> Result<String> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => non_empty(raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CredentialError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(CredentialError::FileRead(e.to_string())),
        }
    }
}

/// The platform's native credential store
pub struct PlatformSecretStore {
    service: String,
    fallback: CredentialsFile,
}

impl PlatformSecretStore {
    pub fn new(service: &str, fallback_file: impl Into<PathBuf>) -> Self {
        Self {
            service: service.to_string(),
            fallback: CredentialsFile::new(fallback_file),
        }
    }

    /// Keychain account the CLI files its item under
    fn account(&self) -> String {
        if cfg!(target_os = "macos") {
            whoami::username()
        } else {
            FALLBACK_ACCOUNT.to_string()
        }
    }
}

impl SecretSource for PlatformSecretStore {
    fn read(&self) -> Result<String> {
        match read_password(&self.service, &self.account()) {
            Ok(Some(raw)) if !raw.trim().is_empty() => Ok(raw),
            Ok(_) => self.fallback.read(),
            Err(e) => {
                log::debug!("Keyring lookup for '{}' failed: {}", self.service, e);
                self.fallback.read()
            }
        }
    }
}
