//! Persistence-store interface for the provider manager.
//!
//! The manager persists a single named JSON document (active provider,
//! selection strategy, per-provider enabled flags) and reloads it at
//! initialization. Applications inject any [`StateStore`] implementation;
//! [`JsonFileStore`] keeps documents as `.json` files under a directory and
//! [`MemoryStore`] backs tests.

use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

pub type StoreResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A minimal named-document store.
///
/// Implementations must be safe under concurrent callers; the provider
/// manager serializes its own writes but other components may share a store.
pub trait StateStore: Send + Sync {
    /// Load a document by name, `Ok(None)` when it was never saved.
    fn load(&self, name: &str) -> StoreResult<Option<Value>>;

    /// Persist a document under the given name, replacing any previous value.
    fn save(&self, name: &str, document: &Value) -> StoreResult<()>;
}

/// File-backed store: each document is `<dir>/<name>.json`.
///
/// Saves write to a temporary sibling file first and rename it into place, so
/// a crash mid-write never leaves a truncated document behind.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, name: &str) -> StoreResult<Option<Value>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, name: &str, document: &Value) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let tmp = self.dir.join(format!("{}.json.tmp", name));
        fs::write(&tmp, serde_json::to_string_pretty(document)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// In-memory store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn load(&self, name: &str) -> StoreResult<Option<Value>> {
        Ok(self.documents.lock().unwrap().get(name).cloned())
    }

    fn save(&self, name: &str, document: &Value) -> StoreResult<()> {
        self.documents
            .lock()
            .unwrap()
            .insert(name.to_string(), document.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_round_trips() {
        let store = MemoryStore::new();
        assert!(store.load("settings").unwrap().is_none());
        store.save("settings", &json!({"active": "ollama"})).unwrap();
        let doc = store.load("settings").unwrap().unwrap();
        assert_eq!(doc["active"], "ollama");
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("providers").unwrap().is_none());
        store.save("providers", &json!({"enabled": true})).unwrap();
        let doc = store.load("providers").unwrap().unwrap();
        assert_eq!(doc["enabled"], true);
        // Overwrite replaces the previous document.
        store.save("providers", &json!({"enabled": false})).unwrap();
        assert_eq!(store.load("providers").unwrap().unwrap()["enabled"], false);
    }
}
