//! The persistent base layer of the snapshot stack.
//!
//! Exactly one disk layer exists at a time. It serves reads straight from
//! the flat store through a byte-bounded LRU cache, gated by the generator's
//! progress marker: regions the background generation has not reached yet
//! must not be answered from flat data alone.
use crate::constant::{account_snapshot_key, storage_snapshot_key};
use crate::snapshot::generate::GeneratorStats;
use crate::snapshot::SnapshotError;
use crate::traits::{KeyValueStore, NodeReader};
use alloy_primitives::B256;
use lru::LruCache;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::mpsc;
use std::sync::Arc;

/// Reply channel handed to the generator on shutdown; the generator answers
/// with its final statistics, or `None` if generation had already finished.
pub(crate) type AbortReply = mpsc::Sender<Option<GeneratorStats>>;

/// Completion signal for background generation.
#[derive(Default)]
pub(crate) struct GenPending {
    done: Mutex<bool>,
    cond: Condvar,
}

impl GenPending {
    pub(crate) fn close(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}

/// Byte-bounded LRU cache over flat entries. Empty values cache known
/// absence.
struct SizedCache {
    inner: LruCache<Vec<u8>, Vec<u8>>,
    bytes: usize,
    limit: usize,
}

impl SizedCache {
    fn new(limit: usize) -> Self {
        Self {
            inner: LruCache::unbounded(),
            bytes: 0,
            limit,
        }
    }

    fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        self.inner.get(key).cloned()
    }

    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.bytes += key.len() + value.len();
        if let Some((old_key, old_value)) = self.inner.push(key, value) {
            self.bytes -= old_key.len() + old_value.len();
        }
        while self.bytes > self.limit {
            match self.inner.pop_lru() {
                Some((k, v)) => self.bytes -= k.len() + v.len(),
                None => break,
            }
        }
    }
}

struct DiskInner {
    /// Progress of background generation: `Some(vec![])` before anything was
    /// generated, a 32- or 64-byte prefix while paused mid-keyspace, `None`
    /// once fully generated.
    gen_marker: Option<Vec<u8>>,
    /// Set when the layer is retired; all subsequent reads fail.
    stale: bool,
}

/// Persistent snapshot layer at a specific state root.
pub struct DiskLayer<S> {
    db: Arc<S>,
    root: B256,
    cache: Mutex<SizedCache>,
    inner: RwLock<DiskInner>,
    pub(crate) gen_pending: GenPending,
    pub(crate) gen_abort: Mutex<Option<mpsc::Sender<AbortReply>>>,
}

impl<S> std::fmt::Debug for DiskLayer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskLayer")
            .field("root", &self.root)
            .field("gen_marker", &self.inner.read().gen_marker)
            .finish_non_exhaustive()
    }
}

impl<S: KeyValueStore + NodeReader> DiskLayer<S> {
    /// Creates a disk layer over the given store. `gen_marker` carries the
    /// resumed generation progress; `None` means fully generated.
    pub(crate) fn new(db: Arc<S>, root: B256, cache_bytes: usize, gen_marker: Option<Vec<u8>>) -> Self {
        let generated = gen_marker.is_none();
        let layer = Self {
            db,
            root,
            cache: Mutex::new(SizedCache::new(cache_bytes)),
            inner: RwLock::new(DiskInner {
                gen_marker,
                stale: false,
            }),
            gen_pending: GenPending::default(),
            gen_abort: Mutex::new(None),
        };
        if generated {
            layer.gen_pending.close();
        }
        layer
    }

    /// The flat store backing this layer.
    pub fn db(&self) -> &Arc<S> {
        &self.db
    }

    /// Root hash of the state this layer snapshots.
    pub fn root(&self) -> B256 {
        self.root
    }

    /// Whether the layer has been retired.
    pub fn is_stale(&self) -> bool {
        self.inner.read().stale
    }

    /// Whether background generation is still running.
    pub fn is_generating(&self) -> bool {
        self.inner.read().gen_marker.is_some()
    }

    /// The current generation progress marker.
    pub fn gen_marker(&self) -> Option<Vec<u8>> {
        self.inner.read().gen_marker.clone()
    }

    pub(crate) fn set_gen_marker(&self, marker: Option<Vec<u8>>) {
        self.inner.write().gen_marker = marker;
    }

    pub(crate) fn mark_stale(&self) {
        self.inner.write().stale = true;
    }

    /// Blocks until background generation has finished.
    pub fn wait_generation(&self) {
        self.gen_pending.wait();
    }

    /// Asks the background generator to flush and stop, returning its final
    /// statistics. Returns `None` if no generator is running or generation
    /// had already completed.
    pub fn abort_generation(&self) -> Option<GeneratorStats> {
        let sender = self.gen_abort.lock().clone();
        let sender = sender?;
        let (reply_tx, reply_rx) = mpsc::channel();
        if sender.send(reply_tx).is_err() {
            return None;
        }
        reply_rx.recv().ok().flatten()
    }

    /// Rejects reads beyond the generated region. The marker position itself
    /// has already been flushed and is servable.
    fn check_coverage(&self, key_tail: &[u8]) -> Result<(), SnapshotError> {
        let inner = self.inner.read();
        if inner.stale {
            return Err(SnapshotError::Stale);
        }
        if let Some(marker) = &inner.gen_marker {
            if key_tail > marker.as_slice() {
                return Err(SnapshotError::NotCoveredYet);
            }
        }
        Ok(())
    }

    fn cached_get(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>, SnapshotError> {
        if let Some(blob) = self.cache.lock().get(&key) {
            return Ok((!blob.is_empty()).then_some(blob));
        }
        let value = self
            .db
            .get(&key)
            .map_err(|err| SnapshotError::Store(format!("{err:?}")))?;
        self.cache
            .lock()
            .insert(key, value.clone().unwrap_or_default());
        Ok(value.filter(|v| !v.is_empty()))
    }

    /// Retrieves the slim account RLP for the given account hash, if the
    /// flat snapshot holds one.
    pub fn account_rlp(&self, account_hash: &B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        self.check_coverage(account_hash.as_slice())?;
        self.cached_get(account_snapshot_key(account_hash))
    }

    /// Retrieves a raw storage slot value.
    pub fn storage(
        &self,
        account_hash: &B256,
        slot_hash: &B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError> {
        let mut tail = [0u8; 64];
        tail[..32].copy_from_slice(account_hash.as_slice());
        tail[32..].copy_from_slice(slot_hash.as_slice());
        self.check_coverage(&tail)?;
        self.cached_get(storage_snapshot_key(account_hash, slot_hash))
    }
}
