//! Persistent property storage seam
//!
//! The persistent unique id has to survive restarts, so the controller
//! reads it through this trait. Embedders back it with whatever they have
//! (a file, a registry, a device property store); tests use [`MemoryStore`].

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Store key for the persistent unique sensor id.
pub const UNIQUE_ID_KEY: &str = "sensor-unique-id";

/// Minimal key/value persistence for sensor properties
pub trait PropertyStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// In-memory property store
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PropertyStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.into(), value.into());
    }
}
