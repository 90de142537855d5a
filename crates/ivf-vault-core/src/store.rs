//! JSON record layer over a [`StorageBackend`].
//!
//! Every persisted record in this crate is a serde type stored as JSON bytes
//! under a `/`-separated key. [`JsonStore`] does the encoding once so the
//! subsystems only deal with typed values. [`SettingsStore`] is the generic
//! key→JSON settings table (DEK version metadata, provider lists, session
//! bindings, rotation state).

use std::sync::Arc;

use ivf_vault_storage::StorageBackend;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Typed JSON access to a storage backend.
#[derive(Clone)]
pub struct JsonStore {
    storage: Arc<dyn StorageBackend>,
}

impl JsonStore {
    /// Wrap a storage backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Read and decode the record at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails or the bytes do not decode.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.storage.get(key).await? {
            Some(bytes) => Ok(Some(decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and write `value` at `key`, replacing any existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or the backend write fails.
    pub async fn put<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = encode(key, value)?;
        self.storage.put(key, &bytes).await?;
        Ok(())
    }

    /// Encode and write `value` only if `key` is free. Returns whether it was
    /// written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if encoding or the backend write fails.
    pub async fn put_if_absent<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<bool, StoreError> {
        let bytes = encode(key, value)?;
        Ok(self.storage.put_if_absent(key, &bytes).await?)
    }

    /// Delete the record at `key`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys under `prefix`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.storage.list(prefix).await?)
    }

    /// Load every record under `prefix`. Keys that vanish between the list
    /// and the read are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the backend fails or any record does not decode.
    pub async fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, StoreError> {
        let keys = self.list(prefix).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                out.push(value);
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for JsonStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStore").finish_non_exhaustive()
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

/// Storage prefix for settings.
const SETTINGS_PREFIX: &str = "sys/settings/";

/// Generic key→JSON settings store.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    store: JsonStore,
}

impl SettingsStore {
    /// Create a settings store over the given backend.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            store: JsonStore::new(storage),
        }
    }

    fn key(name: &str) -> String {
        format!("{SETTINGS_PREFIX}{name}")
    }

    /// Read a setting.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend or decode failure.
    pub async fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        self.store.get(&Self::key(name)).await
    }

    /// Write a setting, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend or encode failure.
    pub async fn set<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        self.store.put(&Self::key(name), value).await
    }

    /// Write a setting only if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend or encode failure.
    pub async fn set_if_absent<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<bool, StoreError> {
        self.store.put_if_absent(&Self::key(name), value).await
    }

    /// Delete a setting. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.store.delete(&Self::key(name)).await
    }

    /// Setting names that start with `prefix`, without the storage prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on backend failure.
    pub async fn names(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys = self.store.list(&Self::key(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(SETTINGS_PREFIX).map(str::to_owned))
            .collect())
    }
}
