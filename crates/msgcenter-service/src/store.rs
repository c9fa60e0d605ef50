//! Persisted subscription state and push sender ids.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Key/value persistence owned by the host. Implementations must be cheap to
/// call while the connection state lock is held.
pub trait SubscriptionStore: Send + Sync {
    /// Missing entries read as `false`.
    fn is_subscribed(&self, service: &str, user: &str) -> bool;
    fn set_subscribed(&self, service: &str, user: &str, subscribed: bool) -> Result<()>;
    fn sender_ids(&self) -> Vec<String>;
    fn set_sender_ids(&self, ids: &[String]) -> Result<()>;
}

// Service and user names cannot contain ':', so the key is unambiguous.
fn record_key(service: &str, user: &str) -> String {
    format!("{service}:{user}")
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    subscriptions: BTreeMap<String, bool>,
    #[serde(default)]
    sender_ids: Vec<String>,
}

impl StoreData {
    fn is_subscribed(&self, service: &str, user: &str) -> bool {
        self.subscriptions
            .get(&record_key(service, user))
            .copied()
            .unwrap_or(false)
    }

    fn set_subscribed(&mut self, service: &str, user: &str, subscribed: bool) {
        self.subscriptions
            .insert(record_key(service, user), subscribed);
    }

    fn set_sender_ids(&mut self, ids: &[String]) {
        self.sender_ids = ids
            .iter()
            .filter(|id| !id.is_empty())
            .cloned()
            .collect();
    }
}

fn poisoned() -> Error {
    Error::Store("store lock poisoned".to_string())
}

/// In-process store; state is lost with the process.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for MemoryStore {
    fn is_subscribed(&self, service: &str, user: &str) -> bool {
        self.data
            .lock()
            .map(|d| d.is_subscribed(service, user))
            .unwrap_or(false)
    }

    fn set_subscribed(&self, service: &str, user: &str, subscribed: bool) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| poisoned())?;
        data.set_subscribed(service, user, subscribed);
        Ok(())
    }

    fn sender_ids(&self) -> Vec<String> {
        self.data
            .lock()
            .map(|d| d.sender_ids.clone())
            .unwrap_or_default()
    }

    fn set_sender_ids(&self, ids: &[String]) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| poisoned())?;
        data.set_sender_ids(ids);
        Ok(())
    }
}

/// JSON file store. Every mutation rewrites the file through a temp file and
/// rename.
pub struct FileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| Error::Store(format!("parse {}: {e}", path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(Error::Store(format!("read {}: {e}", path.display()))),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn persist(&self, data: &StoreData) -> Result<()> {
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| Error::Store(format!("serialize store: {e}")))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| Error::Store(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Store(format!("rename {}: {e}", self.path.display())))
    }
}

impl SubscriptionStore for FileStore {
    fn is_subscribed(&self, service: &str, user: &str) -> bool {
        self.data
            .lock()
            .map(|d| d.is_subscribed(service, user))
            .unwrap_or(false)
    }

    fn set_subscribed(&self, service: &str, user: &str, subscribed: bool) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| poisoned())?;
        let mut next = data.clone();
        next.set_subscribed(service, user, subscribed);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    fn sender_ids(&self) -> Vec<String> {
        self.data
            .lock()
            .map(|d| d.sender_ids.clone())
            .unwrap_or_default()
    }

    fn set_sender_ids(&self, ids: &[String]) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| poisoned())?;
        let mut next = data.clone();
        next.set_sender_ids(ids);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_record_reads_false() {
        let store = MemoryStore::new();
        assert!(!store.is_subscribed("chat", "alice"));
        store.set_subscribed("chat", "alice", true).unwrap();
        assert!(store.is_subscribed("chat", "alice"));
        assert!(!store.is_subscribed("chat", "bob"));
    }

    #[test]
    fn sender_ids_drop_empty_entries() {
        let store = MemoryStore::new();
        store
            .set_sender_ids(&["123".to_string(), String::new(), "456".to_string()])
            .unwrap();
        assert_eq!(store.sender_ids(), vec!["123", "456"]);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgcenter.json");

        let store = FileStore::open(&path).unwrap();
        assert!(!store.is_subscribed("chat", "alice"));
        store.set_subscribed("chat", "alice", true).unwrap();
        store.set_sender_ids(&["sender-1".to_string()]).unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        assert!(reopened.is_subscribed("chat", "alice"));
        assert_eq!(reopened.sender_ids(), vec!["sender-1"]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msgcenter.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(FileStore::open(&path), Err(Error::Store(_))));
    }

    #[test]
    fn file_store_write_failure_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("msgcenter.json");
        let store = FileStore::open(&path).unwrap();
        assert!(store.set_subscribed("chat", "alice", true).is_err());
        assert!(!store.is_subscribed("chat", "alice"));
    }
}
