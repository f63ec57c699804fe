use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::sandbox::{Error, Result};

/// A keyed set of shared handles.
/// Every operation takes the lock once, so per-key operations are
/// linearizable and callers never need to lock themselves.
pub struct Registry<T: ?Sized> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::default(),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` under `key`, failing if the key is taken.
    pub fn add(&self, key: impl Into<String>, value: Arc<T>) -> Result<()> {
        let key = key.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.contains_key(&key) {
            return Err(Error::AlreadyExists(key));
        }
        entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    /// Removes `key`. Removing a missing key is a no-op.
    pub fn delete(&self, key: &str) -> Option<Arc<T>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key)
    }

    /// Snapshot of every entry. Later changes to the registry are not reflected.
    pub fn list(&self) -> Vec<(String, Arc<T>)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
