//! Transient trie-node cache assembled from a verified flat range.
//!
//! When a range proof fails, the generator falls back to trie iteration. The
//! collected flat batch is close to the trie content, so committing it into
//! an empty trie yields most of the node blobs the iteration will need.
//! Lookups probe these batch-derived nodes first and relay to the persistent
//! node store on miss. The cache lives for one range step only.
use crate::mem_store::MemStore;
use crate::traits::NodeReader;
use alloy_primitives::B256;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Node reader probing a batch-derived node set before the backing store.
pub struct RelayCache<'a> {
    primary: MemStore,
    fallback: &'a dyn NodeReader,
    primary_hits: AtomicU64,
    relayed: AtomicU64,
}

impl<'a> RelayCache<'a> {
    /// Builds the cache by inserting the batch into an empty trie and
    /// committing the resulting nodes.
    pub fn from_batch(keys: &[B256], vals: &[Vec<u8>], fallback: &'a dyn NodeReader) -> Self {
        let primary = MemStore::new();
        let mut trie = crate::trie::MemTrie::new();
        for (key, value) in keys.iter().zip(vals) {
            trie.insert(key, value.clone())
                .expect("fresh builder holds no unresolved subtrees");
        }
        trie.commit(&primary);
        Self {
            primary,
            fallback,
            primary_hits: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
        }
    }
}

impl NodeReader for RelayCache<'_> {
    fn node(&self, hash: &B256) -> Option<Vec<u8>> {
        if let Some(blob) = self.primary.node(hash) {
            self.primary_hits.fetch_add(1, Ordering::Relaxed);
            return Some(blob);
        }
        self.relayed.fetch_add(1, Ordering::Relaxed);
        self.fallback.node(hash)
    }
}

impl Drop for RelayCache<'_> {
    fn drop(&mut self) {
        debug!(
            primaries = self.primary_hits.load(Ordering::Relaxed),
            relays = self.relayed.load(Ordering::Relaxed),
            "Relay node cache used"
        );
    }
}
