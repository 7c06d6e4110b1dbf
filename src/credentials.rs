//! Persisted username/password pair for the hosting platform.
//!
//! The pair is prompted for once and kept in the system keyring: the
//! username under a fixed key, the password under the username. Rejected
//! credentials are erased so the next run prompts again.

use inquire::{Password, Text};
use keyring::Entry;
use tracing::{debug, info};

use crate::error::{Result, SyncError};

const USERNAME_KEY: &str = "username";

/// Secrets addressed by service and key.
#[cfg_attr(test, mockall::automock)]
pub trait SecretStore: Send + Sync {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>>;

    fn set(&self, service: &str, key: &str, secret: &str) -> Result<()>;

    /// Removing a missing secret is not an error.
    fn delete(&self, service: &str, key: &str) -> Result<()>;
}

/// The platform keyring (Keychain, Credential Manager or kernel keyutils)
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl KeyringStore {
    fn entry(service: &str, key: &str) -> Result<Entry> {
        Entry::new(service, key).map_err(keyring_error)
    }
}

impl SecretStore for KeyringStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>> {
        match Self::entry(service, key)?.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(keyring_error(e)),
        }
    }

    fn set(&self, service: &str, key: &str, secret: &str) -> Result<()> {
        Self::entry(service, key)?
            .set_password(secret)
            .map_err(keyring_error)
    }

    fn delete(&self, service: &str, key: &str) -> Result<()> {
        match Self::entry(service, key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(keyring_error(e)),
        }
    }
}

fn keyring_error(e: keyring::Error) -> SyncError {
    SyncError::Credentials(format!("System keyring: {}", e))
}

/// Credential pair for one service.
pub struct Credentials {
    service: String,
    store: Box<dyn SecretStore>,
}

impl Credentials {
    /// Pair for `service` in the system keyring.
    pub fn new(service: &str) -> Self {
        Self::with_store(service, KeyringStore)
    }

    pub fn with_store(service: &str, store: impl SecretStore + 'static) -> Self {
        Self {
            service: service.to_string(),
            store: Box::new(store),
        }
    }

    /// The stored pair, if both halves are present.
    pub fn stored(&self) -> Result<Option<(String, String)>> {
        let username = self
            .store
            .get(&self.service, USERNAME_KEY)?
            .filter(|u| !u.is_empty());
        let Some(username) = username else {
            return Ok(None);
        };
        let password = self
            .store
            .get(&self.service, &username)?
            .filter(|p| !p.is_empty());
        Ok(password.map(|password| (username, password)))
    }

    /// Stored pair, or prompt for it on the terminal.
    pub fn load(&self) -> Result<(String, String)> {
        if let Some(pair) = self.stored()? {
            debug!("Using stored {} credentials", self.service);
            return Ok(pair);
        }

        let default_user = std::env::var("USER").unwrap_or_default();
        let username = Text::new(&format!("{} username:", self.service))
            .with_default(&default_user)
            .prompt()
            .map_err(|e| SyncError::Credentials(e.to_string()))?;
        let password = Password::new(&format!("{} password or token:", self.service))
            .without_confirmation()
            .prompt()
            .map_err(|e| SyncError::Credentials(e.to_string()))?;

        Ok((username, password))
    }

    pub fn save(&self, username: &str, password: &str) -> Result<()> {
        self.store.set(&self.service, USERNAME_KEY, username)?;
        self.store.set(&self.service, username, password)?;
        debug!("Saved {} credentials to the system keyring", self.service);
        Ok(())
    }

    /// Forget the stored pair.
    pub fn clean(&self) -> Result<()> {
        if let Some(username) = self.store.get(&self.service, USERNAME_KEY)? {
            self.store.delete(&self.service, &username)?;
        }
        self.store.delete(&self.service, USERNAME_KEY)?;
        info!("Removed stored {} credentials", self.service);
        Ok(())
    }
}
