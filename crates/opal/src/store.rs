//! In-memory content database.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Mutex;
use utpal::{ContentStore, NetworkId};

/// Process-local key/value store, keyed by network and content key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(u16, Vec<u8>), Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentStore for MemoryStore {
    fn put(&self, network: NetworkId, key: &[u8], value: Bytes) {
        self.entries
            .lock()
            .expect("store lock")
            .insert((network.0, key.to_vec()), value);
    }

    fn get(&self, network: NetworkId, key: &[u8]) -> Option<Bytes> {
        self.entries
            .lock()
            .expect("store lock")
            .get(&(network.0, key.to_vec()))
            .cloned()
    }
}
