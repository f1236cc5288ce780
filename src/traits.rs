//! Storage seams consumed by the snapshot subsystem.
//!
//! Two independent contracts: an ordered key/value store holding the flat
//! snapshot data and a content-addressed blob store holding encoded trie
//! nodes. [`crate::mem_store::MemStore`] implements both; production
//! backends substitute their own implementations.
use alloy_primitives::B256;
use std::fmt::Debug;

/// A single pending mutation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite a key.
    Put(Vec<u8>, Vec<u8>),
    /// Remove a key.
    Delete(Vec<u8>),
}

/// An ordered set of mutations applied atomically via
/// [`KeyValueStore::write_batch`].
///
/// The batch is owned by exactly one writer between flushes; `value_size`
/// gauges how much data is pending so callers can bound the progress lost on
/// a crash.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
    size: usize,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an insert or overwrite.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.size += key.len() + value.len();
        self.ops.push(BatchOp::Put(key, value));
    }

    /// Queues a deletion.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.size += key.len();
        self.ops.push(BatchOp::Delete(key));
    }

    /// Approximate number of bytes queued in the batch.
    pub fn value_size(&self) -> usize {
        self.size
    }

    /// Drops all queued mutations, retaining the allocation.
    pub fn reset(&mut self) {
        self.ops.clear();
        self.size = 0;
    }

    /// The queued mutations in insertion order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }
}

/// Ordered key/value store holding the flat snapshot data.
pub trait KeyValueStore: Debug + Send + Sync {
    /// Error type of the backing store.
    type Error: Debug + Send + Sync + 'static;

    /// Point lookup.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Returns up to `limit` entries under `prefix` in ascending key order,
    /// starting at the first key `>= prefix || origin`.
    fn entries(
        &self,
        prefix: &[u8],
        origin: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error>;

    /// Applies a batch of mutations atomically. The batch is left untouched;
    /// callers reset it themselves.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), Self::Error>;
}

/// Read access to encoded trie nodes, keyed by their keccak hash.
pub trait NodeReader {
    /// Returns the encoded node with the given hash, if present.
    fn node(&self, hash: &B256) -> Option<Vec<u8>>;
}

/// Write access to encoded trie nodes.
pub trait NodeWriter {
    /// Stores an encoded node under its hash.
    fn insert_node(&self, hash: B256, blob: Vec<u8>);
}
