//! Session persistence.
//!
//! `{session_token, user_id}` is written as one atomic JSON blob per
//! application id, so an observer of storage changes never sees one
//! field without the other. The storage backend is pluggable; the
//! default keeps everything in memory for the process lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

use confab_shared::constants::session_storage_key;

/// The persisted session state, serialized as a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBlob {
    pub session_token: String,
    pub user_id: String,
}

/// Pluggable key/value storage for the session blob.
pub trait SessionStore: Send + Sync {
    fn load(&self, key: &str) -> Option<String>;
    fn save(&self, key: &str, value: &str);
    fn clear(&self, key: &str);
}

/// Default in-memory store.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, key: &str) -> Option<String> {
        self.entries.lock().expect("store lock").get(key).cloned()
    }

    fn save(&self, key: &str, value: &str) {
        self.entries
            .lock()
            .expect("store lock")
            .insert(key.to_string(), value.to_string());
    }

    fn clear(&self, key: &str) {
        self.entries.lock().expect("store lock").remove(key);
    }
}

/// Typed facade over a [`SessionStore`] for one application id.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    key: String,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, app_id: &str) -> Self {
        Self {
            store,
            key: session_storage_key(app_id),
        }
    }

    /// Persist token and user id as one write.
    pub fn persist(&self, blob: &SessionBlob) {
        match serde_json::to_string(blob) {
            Ok(raw) => self.store.save(&self.key, &raw),
            Err(e) => warn!(error = %e, "Failed to serialize session blob"),
        }
    }

    pub fn restore(&self) -> Option<SessionBlob> {
        let raw = self.store.load(&self.key)?;
        match serde_json::from_str(&raw) {
            Ok(blob) => Some(blob),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session blob");
                None
            }
        }
    }

    pub fn clear(&self) {
        self.store.clear(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_restore_clear_roundtrip() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), "app-1");
        assert!(manager.restore().is_none());

        let blob = SessionBlob {
            session_token: "tok".to_string(),
            user_id: "user-a".to_string(),
        };
        manager.persist(&blob);
        assert_eq!(manager.restore(), Some(blob));

        manager.clear();
        assert!(manager.restore().is_none());
    }

    #[test]
    fn test_blob_is_one_atomic_value() {
        let store = Arc::new(MemorySessionStore::new());
        let manager = SessionManager::new(store.clone(), "app-1");
        manager.persist(&SessionBlob {
            session_token: "tok".to_string(),
            user_id: "user-a".to_string(),
        });

        // A storage observer sees a single value carrying both fields.
        let raw = store.load(&session_storage_key("app-1")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["session_token"], "tok");
        assert_eq!(value["user_id"], "user-a");
    }

    #[test]
    fn test_stores_are_scoped_by_app_id() {
        let store = Arc::new(MemorySessionStore::new());
        let first = SessionManager::new(store.clone(), "app-1");
        let second = SessionManager::new(store, "app-2");
        first.persist(&SessionBlob {
            session_token: "tok".to_string(),
            user_id: "user-a".to_string(),
        });
        assert!(second.restore().is_none());
    }
}
