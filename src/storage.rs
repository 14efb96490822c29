//! Tab-scoped key/value storage and the cached user record kept in it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;
use crate::types::UserSummary;

/// Default storage key of the cached user.
pub const DEFAULT_USER_KEY: &str = "userData";

/// String key/value storage with web-storage semantics.
pub trait Storage: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, Error>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), Error>;

    fn remove_item(&self, key: &str) -> Result<(), Error>;
}

/// In-process storage that lives as long as the value does.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), Error> {
        self.items.lock().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), Error> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Last user fetched from the backend, kept as JSON under a fixed key.
///
/// Used as the stale-cache fallback when token validation fails.
#[derive(Clone)]
pub struct UserCache {
    storage: Arc<dyn Storage>,
    key: String,
}

impl UserCache {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_key(storage, DEFAULT_USER_KEY)
    }

    #[must_use]
    pub fn with_key(storage: Arc<dyn Storage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::Serialization`] if the stored record is not a valid
    /// user, or any error from the underlying storage.
    pub fn load(&self) -> Result<Option<UserSummary>, Error> {
        match self.storage.get_item(&self.key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns any error from the underlying storage.
    pub fn store(&self, user: &UserSummary) -> Result<(), Error> {
        let raw = serde_json::to_string(user)?;
        self.storage.set_item(&self.key, &raw)
    }

    /// # Errors
    ///
    /// Returns any error from the underlying storage.
    pub fn clear(&self) -> Result<(), Error> {
        self.storage.remove_item(&self.key)
    }
}
