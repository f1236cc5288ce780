//! In-memory storage backend for the snapshot subsystem.
//!
//! [`MemStore`] implements both the ordered flat store
//! ([`KeyValueStore`]) and the trie node store ([`NodeReader`] /
//! [`NodeWriter`]) over [`BTreeMap`] collections. It is primarily intended
//! for unit and integration testing and as a reference implementation of the
//! storage traits; production deployments back these traits with a real
//! database.
//!
//! All operations are thread-safe through [`RwLock`] interior mutability.
use crate::traits::{BatchOp, KeyValueStore, NodeReader, NodeWriter, WriteBatch};
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::convert::Infallible;

/// In-memory flat store and trie node store.
#[derive(Debug, Default)]
pub struct MemStore {
    /// Flat snapshot entries, ordered by key.
    kvs: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Encoded trie nodes keyed by their hash.
    nodes: RwLock<BTreeMap<B256, Vec<u8>>>,
}

impl MemStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flat entries currently stored.
    pub fn len(&self) -> usize {
        self.kvs.read().len()
    }

    /// Whether the flat store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.kvs.read().is_empty()
    }

    /// Directly inserts a flat entry, bypassing batching. Test helper.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.kvs.write().insert(key, value);
    }

    /// All flat keys carrying the given prefix, in order. Test helper.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.kvs
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl Clone for MemStore {
    fn clone(&self) -> Self {
        Self {
            kvs: RwLock::new(self.kvs.read().clone()),
            nodes: RwLock::new(self.nodes.read().clone()),
        }
    }
}

impl KeyValueStore for MemStore {
    type Error = Infallible;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.kvs.read().get(key).cloned())
    }

    fn entries(
        &self,
        prefix: &[u8],
        origin: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        let mut start = prefix.to_vec();
        start.extend_from_slice(origin);
        Ok(self
            .kvs
            .read()
            .range(start..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), Self::Error> {
        let mut kvs = self.kvs.write();
        for op in batch.ops() {
            match op {
                BatchOp::Put(key, value) => {
                    kvs.insert(key.clone(), value.clone());
                }
                BatchOp::Delete(key) => {
                    kvs.remove(key);
                }
            }
        }
        Ok(())
    }
}

impl NodeReader for MemStore {
    fn node(&self, hash: &B256) -> Option<Vec<u8>> {
        self.nodes.read().get(hash).cloned()
    }
}

impl NodeWriter for MemStore {
    fn insert_node(&self, hash: B256, blob: Vec<u8>) {
        self.nodes.write().insert(hash, blob);
    }
}
