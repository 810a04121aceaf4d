//! Session credentials, read through an injected key-value store.
//!
//! The board never owns login: an external session collaborator writes the
//! tokens and identifiers, and the board only reads them (and writes back a
//! refreshed access token). The runner uses the OS credential store via
//! [`KeyringStore`]; tests and embedders can use [`MemoryStore`].

use keyring::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::BoardError;
use crate::model::READ_ONLY_ROLE;

pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_REFRESH_TOKEN: &str = "refresh_token";
pub const KEY_USER_ID: &str = "user_id";
pub const KEY_USER_ROLE: &str = "user_role";
pub const KEY_DEVICE_ID: &str = "device_id";
pub const KEY_OUTLET_ID: &str = "outlet_id";

/// Key-value store holding the session.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn remove(&self, key: &str) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// OS keyring
// ---------------------------------------------------------------------------

/// Credentials in the OS credential store (Keychain, DPAPI, Secret Service).
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl SessionStore for KeyringStore {
    /// Returns `None` when the entry does not exist or the platform store
    /// cannot be read.
    fn get(&self, key: &str) -> Option<String> {
        let entry = match Entry::new(&self.service, key) {
            Ok(e) => e,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to create entry");
                return None;
            }
        };
        match entry.get_password() {
            Ok(pw) => Some(pw),
            Err(keyring::Error::NoEntry) => None,
            Err(e) => {
                warn!(key, error = %e, "keyring: failed to read credential");
                None
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let entry = Entry::new(&self.service, key).map_err(|e| e.to_string())?;
        entry.set_password(value).map_err(|e| e.to_string())
    }

    /// Silently succeeds if the entry does not exist.
    fn remove(&self, key: &str) -> Result<(), String> {
        let entry = Entry::new(&self.service, key).map_err(|e| e.to_string())?;
        match entry.delete_credential() {
            Ok(()) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(pairs: &[(&str, &str)]) -> Self {
        let store = Self::new();
        if let Ok(mut values) = store.values.lock() {
            for (k, v) in pairs {
                values.insert((*k).to_string(), (*v).to_string());
            }
        }
        store
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.values
            .lock()
            .map_err(|e| e.to_string())?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), String> {
        self.values.lock().map_err(|e| e.to_string())?.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session view
// ---------------------------------------------------------------------------

/// Typed access to the session keys.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn SessionStore>,
}

impl Session {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.store
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn access_token(&self) -> Result<Zeroizing<String>, BoardError> {
        self.non_empty(KEY_ACCESS_TOKEN)
            .map(Zeroizing::new)
            .ok_or(BoardError::SessionInvalid)
    }

    pub fn refresh_token(&self) -> Option<Zeroizing<String>> {
        self.non_empty(KEY_REFRESH_TOKEN).map(Zeroizing::new)
    }

    pub fn store_access_token(&self, token: &str) -> Result<(), BoardError> {
        self.store
            .set(KEY_ACCESS_TOKEN, token)
            .map_err(|e| BoardError::Storage(format!("store access token: {e}")))?;
        info!("access token refreshed");
        Ok(())
    }

    pub fn user_id(&self) -> Option<String> {
        self.non_empty(KEY_USER_ID)
    }

    pub fn device_id(&self) -> Option<String> {
        self.non_empty(KEY_DEVICE_ID)
    }

    pub fn outlet_id(&self) -> Option<String> {
        self.non_empty(KEY_OUTLET_ID)
    }

    pub fn role(&self) -> Option<String> {
        self.non_empty(KEY_USER_ROLE)
    }

    /// The read-only role may watch the board but not act on orders.
    pub fn is_read_only(&self) -> bool {
        self.role().as_deref() == Some(READ_ONLY_ROLE)
    }

    pub fn has_credentials(&self) -> bool {
        self.non_empty(KEY_ACCESS_TOKEN).is_some() && self.user_id().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_reads_trimmed_values() {
        let session = Session::new(Arc::new(MemoryStore::with(&[
            (KEY_ACCESS_TOKEN, " tok "),
            (KEY_USER_ID, "42"),
            (KEY_OUTLET_ID, ""),
        ])));
        assert_eq!(session.access_token().unwrap().as_str(), "tok");
        assert_eq!(session.user_id().as_deref(), Some("42"));
        assert_eq!(session.outlet_id(), None);
        assert!(session.has_credentials());
        assert!(session.refresh_token().is_none());
    }

    #[test]
    fn missing_access_token_is_session_invalid() {
        let session = Session::new(Arc::new(MemoryStore::new()));
        assert_eq!(session.access_token().unwrap_err(), BoardError::SessionInvalid);
        assert!(!session.has_credentials());
    }

    #[test]
    fn refreshed_token_is_written_back() {
        let store = Arc::new(MemoryStore::with(&[(KEY_ACCESS_TOKEN, "old")]));
        let session = Session::new(store.clone());
        session.store_access_token("new").unwrap();
        assert_eq!(store.get(KEY_ACCESS_TOKEN).as_deref(), Some("new"));
        store.remove(KEY_ACCESS_TOKEN).unwrap();
        assert!(session.access_token().is_err());
    }

    #[test]
    fn read_only_role() {
        let session = Session::new(Arc::new(MemoryStore::with(&[(KEY_USER_ROLE, "super_owner")])));
        assert!(session.is_read_only());
        let session = Session::new(Arc::new(MemoryStore::with(&[(KEY_USER_ROLE, "chef")])));
        assert!(!session.is_read_only());
    }
}
