//! Client registry.
//!
//! Entities refer to their owning client by application id, never by a
//! strong pointer, and resolve it through an explicit registry object.
//! Entries hold weak references, so a destroyed client is never
//! retained; register on construct, unregister on destroy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

/// Weak-reference registry keyed by application id.
pub struct Registry<T> {
    entries: Mutex<HashMap<String, Weak<T>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, app_id: &str, instance: &Arc<T>) {
        let mut entries = self.entries.lock().expect("registry lock");
        entries.insert(app_id.to_string(), Arc::downgrade(instance));
    }

    pub fn unregister(&self, app_id: &str) {
        let mut entries = self.entries.lock().expect("registry lock");
        entries.remove(app_id);
    }

    /// Resolve an app id to a live instance. Returns `None` for
    /// unknown ids and for instances that have since been destroyed.
    pub fn resolve(&self, app_id: &str) -> Option<Arc<T>> {
        let entries = self.entries.lock().expect("registry lock");
        entries.get(app_id).and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_resolve_unregister() {
        let registry: Registry<String> = Registry::new();
        let instance = Arc::new("client".to_string());

        registry.register("app-1", &instance);
        assert!(registry.resolve("app-1").is_some());
        assert!(registry.resolve("app-2").is_none());

        registry.unregister("app-1");
        assert!(registry.resolve("app-1").is_none());
    }

    #[test]
    fn test_destroyed_instance_does_not_resolve() {
        let registry: Registry<String> = Registry::new();
        let instance = Arc::new("client".to_string());
        registry.register("app-1", &instance);

        drop(instance);
        assert!(registry.resolve("app-1").is_none());
    }
}
