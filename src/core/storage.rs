use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::id::Key;

/// An opaque, already-encrypted document blob.
pub type Document = Vec<u8>;

/// What a put did. Values are write-once per key: an existing entry is left
/// alone rather than overwritten, and the bytes are not compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    Stored,
    LeftExisting,
}

/// Local key-value store for the documents this peer holds.
#[derive(Debug, Default)]
pub struct KvStore {
    map: HashMap<Key, Document>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore {
            map: HashMap::new(),
        }
    }

    pub fn put(&mut self, key: Key, value: Document) -> StoreOp {
        if self.map.contains_key(&key) {
            StoreOp::LeftExisting
        } else {
            self.map.insert(key, value);
            StoreOp::Stored
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Document> {
        self.map.get(key)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
